use crate::{
    peer::{ConnectionState, SignalingState},
    rtp::RtpPacket,
    sctp::{DataChannelId, DataChannelPayload, DataChannelState},
    transceiver::{Track, TransceiverId},
};
use std::net::{IpAddr, SocketAddr};

/// Notifications emitted by a [`PeerConnection`](super::PeerConnection)
///
/// Popped with [`pop_event`](super::PeerConnection::pop_event) after any
/// call into the connection.
#[derive(Debug)]
pub enum PeerConnectionEvent {
    /// The transceiver set changed while the signaling state is stable, the
    /// application should kick off an offer/answer exchange
    NegotiationNeeded,

    SignalingStateChange(SignalingState),

    ConnectionStateChange(ConnectionState),

    /// A new local ICE candidate to trickle to the peer, formatted as a
    /// `candidate:` string
    IceCandidate(String),

    /// A remote track will start delivering media, fired the first time a
    /// negotiation maps a remote sender onto the receiver
    Track {
        transceiver_id: TransceiverId,
        track: Track,
    },

    /// The remote track stopped sending as the result of a renegotiated
    /// direction
    TrackMuted(TransceiverId),

    /// The transceiver was stopped and its track will never resume
    TrackEnded(TransceiverId),

    /// A media packet for a receiver's track
    Rtp {
        transceiver_id: TransceiverId,
        /// Simulcast encoding the packet belongs to
        rid: Option<String>,
        packet: RtpPacket,
    },

    /// A raw RTCP compound packet was received
    Rtcp(Vec<u8>),

    /// The remote peer opened a data channel
    DataChannel(DataChannelId),

    DataChannelStateChange(DataChannelId, DataChannelState),

    /// A message received on an open data channel
    Data(DataChannelId, DataChannelPayload),

    /// A datagram that must be sent over UDP
    SendData {
        data: Vec<u8>,
        /// Local address to send from, if a specific one was discovered
        source: Option<IpAddr>,
        target: SocketAddr,
    },
}
