//! # WebRTC peer connections
//!
//! This crate implements one endpoint of a WebRTC session: the JSEP
//! offer/answer state machine, the RTP media plane it configures and the
//! SCTP data-channel subsystem, multiplexed over a single BUNDLE transport.
//!
//! [`PeerConnection`](peer::PeerConnection) is the top level type. It is
//! sans-io: the caller owns the UDP socket(s), passes received datagrams in
//! via [`receive`](peer::PeerConnection::receive) and sends out whatever
//! [`SendData`](peer::PeerConnectionEvent::SendData) events ask for. Timing
//! is driven through [`poll`](peer::PeerConnection::poll) /
//! [`timeout`](peer::PeerConnection::timeout).
//!
//! Out-of-crate collaborators:
//!
//! - ICE candidate gathering & connectivity checks: the [`ice`] agent
//! - DTLS record layer: `openssl`, SRTP ciphers: [`srtp`]
//! - SCTP association internals: `sctp-proto`
//! - Signaling transport: entirely the caller's problem
//!
//! Support for IO is provided by the `tokio` feature flag as a companion
//! type to be used alongside the peer connection, not as a wrapper.

mod mtu;
mod ssl;

pub mod jitter;
pub mod peer;
pub mod rtp;
pub mod sctp;
pub mod sdp;
pub mod transceiver;
pub(crate) mod transport;

#[cfg(feature = "tokio")]
pub mod tokio;

pub use ice::ReceivedPkt;
pub use mtu::Mtu;
pub use peer::{PeerConnection, PeerConnectionEvent};
pub use ssl::DtlsIdentity;

fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
    }
}
