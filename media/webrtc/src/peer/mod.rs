//! # Peer connection
//!
//! See [`PeerConnection`].
//!
//! Owns the negotiation state machine, the transceiver list, the bundled
//! transport and the SCTP data-channel transport. All state is mutated from
//! the owner's calls only; progress is driven through
//! [`poll`](PeerConnection::poll) / [`timeout`](PeerConnection::timeout) and
//! results surface as [`PeerConnectionEvent`]s.

use crate::{
    DtlsIdentity, Mtu, opt_min,
    rtp::{RtpExtensionIds, RtpPacket, Ssrc},
    sctp::{DataChannelId, DataChannelOptions, DataChannelPayload, SctpEvent, SctpTransport},
    sdp::{
        self, Codec, Codecs, MediaKind, NegotiatedCodec, RtpExtensionIdsExt, answer_direction,
        negotiate::{
            negotiate_codecs, remote_ice_credentials, remote_sha256_fingerprint,
            validate_remote_description,
        },
        push_feedback, unknown_attr,
    },
    transceiver::{ReportsQueue, Track, Transceiver, TransceiverId},
    transport::{
        BundleTransport, DemuxEntry, ReceivedData, TransportConnectionState, TransportEvent,
        dtls::DtlsRole,
    },
};
use bytesstr::BytesStr;
use ice::{Component, IceAgent, IceConnectionState, IceCredentials, ReceivedPkt};
use rtcp_types::{Compound, Nack, Packet, Pli};
use sdp_types::{
    Connection, Direction, Fingerprint, FingerprintAlgorithm, Fmtp, Group, IceOptions,
    IcePassword, IceUsernameFragment, Media, MediaDescription, MediaType, Origin, RtpMap,
    SessionDescription, Setup, SourceAttribute, Time, TransportProtocol,
};
use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

mod error;
mod event;

pub use error::Error;
pub use event::PeerConnectionEvent;

/// JSEP signaling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Aggregated connection state over ICE and DTLS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Type of a session description in the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Options for [`PeerConnection::create_offer`]
#[derive(Debug, Default, Clone, Copy)]
pub struct OfferOptions {
    /// Restart ICE with fresh credentials and a fresh candidate gathering
    pub ice_restart: bool,
}

/// Immutable configuration of a peer connection
#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub stun_servers: Vec<SocketAddr>,
    pub audio_codecs: Codecs,
    pub video_codecs: Codecs,
    /// Reorder window of the receive-side jitter buffers
    pub jitter_latency: Duration,
    /// Base interval for RTCP reports, jittered by ±50% per report
    pub rtcp_report_interval: Duration,
    pub mtu: Mtu,
}

impl Default for RtcConfig {
    fn default() -> Self {
        RtcConfig {
            stun_servers: vec![],
            audio_codecs: Codecs::new().with_codec(Codec::opus()),
            video_codecs: Codecs::new().with_codec(Codec::vp8()).with_codec(Codec::h264()),
            jitter_latency: Duration::from_millis(200),
            rtcp_report_interval: Duration::from_secs(1),
            mtu: Mtu::default(),
        }
    }
}

/// An m-line slot whose transceiver has been removed
///
/// The slot keeps producing a zeroed media section in offers until a new
/// transceiver recycles it.
struct FreeSlot {
    mline_index: usize,
    media_type: MediaType,
    fmts: Vec<u8>,
}

/// The application media section carrying all data channels
struct DataSection {
    mid: BytesStr,
    mline_index: Option<usize>,
}

/// Entry of the planned m-line layout of an offer
enum PlannedSection<'a> {
    Transceiver(&'a Transceiver),
    /// A transceiver not yet associated, placed at this index
    NewTransceiver(&'a Transceiver),
    Free { media_type: MediaType, fmts: Vec<u8> },
    Data,
}

/// One endpoint of a WebRTC session
pub struct PeerConnection {
    config: RtcConfig,
    identity: DtlsIdentity,
    fingerprint: Vec<u8>,
    cname: String,

    session_id: u64,
    session_version: u64,

    signaling_state: SignalingState,
    connection_state: ConnectionState,
    closed: bool,

    transport: BundleTransport,
    sctp: SctpTransport,
    data_section: Option<DataSection>,

    local_credentials: IceCredentials,
    host_addrs: Vec<SocketAddr>,
    stun_servers: Vec<SocketAddr>,
    candidates_emitted: usize,
    remote_ice_set: bool,

    next_transceiver_id: u32,
    transceivers: Vec<Transceiver>,
    free_slots: Vec<FreeSlot>,

    /// Transceivers created by the currently pending remote offer, removed
    /// again on rollback
    provisional: Vec<TransceiverId>,

    current_local: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,

    last_offer: Option<String>,
    last_answer: Option<String>,

    /// Fallback sender SSRC for RTCP packets without an active sender
    fallback_ssrc: Ssrc,

    negotiation_needed: bool,

    events: VecDeque<PeerConnectionEvent>,
}

impl PeerConnection {
    /// Create a new peer connection with its own DTLS identity
    ///
    /// Certificates are never shared: generate a fresh [`DtlsIdentity`] for
    /// every connection.
    pub fn new(identity: DtlsIdentity, config: RtcConfig) -> Self {
        let fingerprint = identity.sha256_fingerprint();

        let mut config = config;
        assign_payload_types(&mut config);

        let local_credentials = IceCredentials::random();

        let mut ice = IceAgent::new_for_offer(local_credentials.clone(), true, true);

        for server in &config.stun_servers {
            ice.add_stun_server(*server);
        }

        let stun_servers = config.stun_servers.clone();

        PeerConnection {
            config,
            identity,
            fingerprint,
            cname: format!("{:016x}", rand::random::<u64>()),
            session_id: u64::from(rand::random::<u16>()),
            session_version: u64::from(rand::random::<u16>()),
            signaling_state: SignalingState::Stable,
            connection_state: ConnectionState::New,
            closed: false,
            transport: BundleTransport::new(ice),
            sctp: SctpTransport::new(),
            data_section: None,
            local_credentials,
            host_addrs: vec![],
            stun_servers,
            candidates_emitted: 0,
            remote_ice_set: false,
            next_transceiver_id: 0,
            transceivers: vec![],
            free_slots: vec![],
            provisional: vec![],
            current_local: None,
            pending_local: None,
            current_remote: None,
            pending_remote: None,
            last_offer: None,
            last_answer: None,
            fallback_ssrc: Ssrc(rand::random()),
            negotiation_needed: false,
            events: VecDeque::new(),
        }
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.pending_local.as_ref().or(self.current_local.as_ref())
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.pending_remote
            .as_ref()
            .or(self.current_remote.as_ref())
    }

    pub fn transceivers(&self) -> impl Iterator<Item = &Transceiver> {
        self.transceivers.iter()
    }

    pub fn transceiver(&self, id: TransceiverId) -> Option<&Transceiver> {
        self.transceivers.iter().find(|t| t.id() == id)
    }

    pub fn transceiver_mut(&mut self, id: TransceiverId) -> Option<&mut Transceiver> {
        self.transceivers.iter_mut().find(|t| t.id() == id)
    }

    pub fn data_channel(&self, id: DataChannelId) -> Option<&crate::sctp::DataChannel> {
        self.sctp.channel(id)
    }

    /// Register a local address used to create ICE host candidates
    ///
    /// All usable addresses of the host should be registered before the
    /// first offer or answer is created.
    pub fn add_host_addr(&mut self, addr: SocketAddr) {
        self.host_addrs.push(addr);
        self.transport.ice_mut().add_host_addr(Component::Rtp, addr);
    }

    pub fn add_stun_server(&mut self, server: SocketAddr) {
        self.stun_servers.push(server);
        self.transport.ice_mut().add_stun_server(server);
    }

    // ==== Transceiver management

    /// Add a transceiver for the given media kind
    pub fn add_transceiver(&mut self, kind: MediaKind, direction: Direction) -> TransceiverId {
        let id = self.make_transceiver(kind, direction);
        self.mark_negotiation_needed();
        id
    }

    /// Attach a local track, reusing a compatible transceiver if possible
    pub fn add_track(&mut self, track: Track) -> TransceiverId {
        let reusable = self.transceivers.iter_mut().find(|t| {
            t.added_by_add_track
                && t.kind() == track.kind
                && t.sender().track().is_none()
                && !t.stopped()
                && matches!(t.direction(), Direction::RecvOnly | Direction::Inactive)
        });

        let id = if let Some(transceiver) = reusable {
            let direction = match transceiver.direction() {
                Direction::RecvOnly => Direction::SendRecv,
                _ => Direction::SendOnly,
            };

            transceiver.set_direction(direction);
            transceiver.sender_mut().set_track(Some(track));
            transceiver.id()
        } else {
            let id = self.make_transceiver(track.kind, Direction::SendRecv);

            let transceiver = self
                .transceivers
                .iter_mut()
                .find(|t| t.id() == id)
                .expect("transceiver was just created");

            transceiver.added_by_add_track = true;
            transceiver.sender_mut().set_track(Some(track));
            id
        };

        self.mark_negotiation_needed();
        id
    }

    /// Detach the track from a sender
    pub fn remove_track(&mut self, id: TransceiverId) -> Result<(), Error> {
        let transceiver = self
            .transceivers
            .iter_mut()
            .find(|t| t.id() == id)
            .ok_or(Error::InvalidSenderId)?;

        if transceiver.sender().track().is_none() {
            return Err(Error::InvalidSenderId);
        }

        transceiver.sender_mut().set_track(None);

        let direction = match transceiver.direction() {
            Direction::SendRecv => Direction::RecvOnly,
            Direction::SendOnly => Direction::Inactive,
            other => other,
        };
        transceiver.set_direction(direction);

        self.mark_negotiation_needed();
        Ok(())
    }

    /// Change the intended direction of a transceiver
    ///
    /// Takes effect with the next negotiation.
    pub fn set_transceiver_direction(
        &mut self,
        id: TransceiverId,
        direction: Direction,
    ) -> Result<(), Error> {
        let transceiver = self
            .transceivers
            .iter_mut()
            .find(|t| t.id() == id)
            .ok_or(Error::InvalidTransceiverId)?;

        if transceiver.stopped() {
            return Err(Error::InvalidTransceiverDirection);
        }

        if transceiver.direction() != direction {
            transceiver.set_direction(direction);
            self.mark_negotiation_needed();
        }

        Ok(())
    }

    /// Stop a transceiver; removal happens with the next negotiation
    pub fn stop_transceiver(&mut self, id: TransceiverId) -> Result<(), Error> {
        let transceiver = self
            .transceivers
            .iter_mut()
            .find(|t| t.id() == id)
            .ok_or(Error::InvalidTransceiverId)?;

        transceiver.stop();
        self.mark_negotiation_needed();
        Ok(())
    }

    fn make_transceiver(&mut self, kind: MediaKind, direction: Direction) -> TransceiverId {
        let id = TransceiverId(self.next_transceiver_id);
        self.next_transceiver_id += 1;

        let codecs = self
            .config_codecs(kind)
            .codecs
            .iter()
            .map(NegotiatedCodec::from_config)
            .collect();

        self.transceivers.push(Transceiver::new(
            id,
            kind,
            direction,
            codecs,
            RtpExtensionIds::offer(),
            self.config.jitter_latency,
            self.config.rtcp_report_interval,
        ));

        id
    }

    fn config_codecs(&self, kind: MediaKind) -> &Codecs {
        match kind {
            MediaKind::Audio => &self.config.audio_codecs,
            MediaKind::Video => &self.config.video_codecs,
        }
    }

    // ==== Data channels

    /// Create a data channel
    ///
    /// The channel opens once the SCTP association is up; creating the
    /// first channel requires a (re)negotiation which includes the
    /// application media section.
    pub fn create_data_channel(
        &mut self,
        now: Instant,
        label: impl Into<String>,
        options: DataChannelOptions,
    ) -> DataChannelId {
        let had_channels = self.sctp.has_channels();

        let id = self.sctp.create_channel(now, label.into(), options);

        if !had_channels && self.data_section.is_none() {
            self.mark_negotiation_needed();
        }

        self.pump(now);
        id
    }

    /// Send a message over a data channel, best effort
    pub fn send_data(&mut self, now: Instant, id: DataChannelId, payload: DataChannelPayload) {
        self.sctp.send(now, id, payload);
        self.pump(now);
    }

    /// Close a data channel
    pub fn close_data_channel(&mut self, now: Instant, id: DataChannelId) {
        self.sctp.close_channel(now, id);
        self.pump(now);
    }

    // ==== Media

    /// Maximum RTP payload size for a transceiver, accounting for SRTP and
    /// header extension overhead
    pub fn max_rtp_payload_size(&self, id: TransceiverId) -> Option<usize> {
        let transceiver = self.transceiver(id)?;

        let mtu = match transceiver.mid() {
            Some(mid) => self.config.mtu.with_additional_rtp_extension(mid.len()),
            None => self.config.mtu,
        };

        Some(mtu.for_rtp_payload())
    }

    /// Send an RTP packet on a transceiver's sender track
    ///
    /// The packet's payload type, sequence number, SSRC and MID extension
    /// are stamped by the sender; timestamp and marker are forwarded as
    /// given. No-op while the connection is not established.
    pub fn send_rtp(&mut self, now: Instant, id: TransceiverId, packet: RtpPacket) {
        if !self.transport.is_connected() {
            return;
        }

        let Some(transceiver) = self.transceivers.iter_mut().find(|t| t.id() == id) else {
            log::warn!("send_rtp with unknown transceiver id");
            return;
        };

        if !direction_includes_send(transceiver.current_direction()) {
            log::debug!("Dropping outbound RTP packet, transceiver does not send");
            return;
        }

        if let Some(packet) = transceiver.sender_mut().send(now, packet) {
            self.transport.send_rtp(&packet);
        }

        self.pump(now);
    }

    // ==== Negotiation

    /// Create an SDP offer from the current transceiver set
    pub fn create_offer(&mut self, options: OfferOptions) -> Result<SessionDescription, Error> {
        match self.signaling_state {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {}
            state => return Err(Error::InvalidState { state }),
        }

        if options.ice_restart {
            self.restart_ice();
        }

        self.assign_mids();

        let plan = self.plan_sections();

        let mut media_descriptions = Vec::with_capacity(plan.len());

        for (index, section) in plan.iter().enumerate() {
            let desc = match section {
                PlannedSection::Transceiver(t) | PlannedSection::NewTransceiver(t) => {
                    if t.stopping() {
                        self.rejected_media_description(t)
                    } else {
                        self.media_description_for_transceiver(t, t.direction(), index == 0)
                    }
                }
                PlannedSection::Free { media_type, fmts } => {
                    zeroed_media_description(*media_type, fmts.clone())
                }
                PlannedSection::Data => self.data_media_description(index == 0),
            };

            media_descriptions.push(desc);
        }

        let bundle_mids = plan
            .iter()
            .filter_map(|section| match section {
                PlannedSection::Transceiver(t) | PlannedSection::NewTransceiver(t) => {
                    (!t.stopping()).then(|| BytesStr::from(t.mid().expect("mid was assigned")))
                }
                PlannedSection::Free { .. } => None,
                PlannedSection::Data => self.data_section.as_ref().map(|d| d.mid.clone()),
            })
            .collect();

        let offer = self.session_description(media_descriptions, bundle_mids);

        self.last_offer = Some(offer.to_string());
        self.negotiation_needed = false;

        Ok(offer)
    }

    /// Create an SDP answer to the pending remote offer
    pub fn create_answer(&mut self) -> Result<SessionDescription, Error> {
        match self.signaling_state {
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer => {}
            state => return Err(Error::InvalidState { state }),
        }

        let remote = self
            .pending_remote
            .clone()
            .ok_or(Error::NoRemoteDescription)?;

        let mut media_descriptions = Vec::with_capacity(remote.media_descriptions.len());
        let mut bundle_mids = vec![];

        for (index, remote_desc) in remote.media_descriptions.iter().enumerate() {
            if sdp::is_data_media(remote_desc) {
                if remote_desc.media.port != 0 {
                    let desc = self.data_media_description(index == 0);
                    if let Some(data_section) = &self.data_section {
                        bundle_mids.push(data_section.mid.clone());
                    }
                    media_descriptions.push(desc);
                } else {
                    media_descriptions.push(rejected_remote_media_description(remote_desc));
                }
                continue;
            }

            let transceiver = self
                .transceivers
                .iter()
                .find(|t| t.mline_index() == Some(index));

            let Some(transceiver) = transceiver else {
                // Unsupported or zeroed media section, reject it
                media_descriptions.push(rejected_remote_media_description(remote_desc));
                continue;
            };

            if transceiver.stopping() || transceiver.codecs().is_empty() {
                media_descriptions.push(self.rejected_media_description(transceiver));
                continue;
            }

            let direction = answer_direction(remote_desc.direction, transceiver.direction());

            let desc = self.media_description_for_transceiver(transceiver, direction, index == 0);

            bundle_mids.push(BytesStr::from(
                transceiver.mid().expect("associated transceivers have a mid"),
            ));
            media_descriptions.push(desc);
        }

        let answer = self.session_description(media_descriptions, bundle_mids);

        self.last_answer = Some(answer.to_string());

        Ok(answer)
    }

    /// Apply a local description
    ///
    /// The description must be the last one returned by
    /// [`create_offer`](Self::create_offer) /
    /// [`create_answer`](Self::create_answer), unaltered. `sdp` is ignored
    /// for rollbacks.
    pub fn set_local_description(
        &mut self,
        now: Instant,
        kind: SdpType,
        sdp: SessionDescription,
    ) -> Result<(), Error> {
        if self.closed {
            return Err(Error::InvalidState {
                state: self.signaling_state,
            });
        }

        match kind {
            SdpType::Offer => {
                self.require_transition(kind, &[SignalingState::Stable, SignalingState::HaveLocalOffer])?;

                if self.last_offer.as_deref() != Some(sdp.to_string().as_str()) {
                    return Err(Error::OfferAltered);
                }

                self.associate_from_local_offer(&sdp);
                self.pending_local = Some(sdp);
                self.set_signaling_state(SignalingState::HaveLocalOffer);
            }
            SdpType::Answer => {
                self.require_transition(
                    kind,
                    &[SignalingState::HaveRemoteOffer, SignalingState::HaveLocalPranswer],
                )?;

                if self.last_answer.as_deref() != Some(sdp.to_string().as_str()) {
                    return Err(Error::AnswerAltered);
                }

                self.apply_local_answer(now, sdp)?;
                self.set_signaling_state(SignalingState::Stable);
            }
            SdpType::Pranswer => {
                self.require_transition(kind, &[SignalingState::HaveRemoteOffer])?;

                if self.last_answer.as_deref() != Some(sdp.to_string().as_str()) {
                    return Err(Error::AnswerAltered);
                }

                self.pending_local = Some(sdp);
                self.set_signaling_state(SignalingState::HaveLocalPranswer);
            }
            SdpType::Rollback => {
                self.require_transition(kind, &[SignalingState::HaveLocalOffer])?;

                self.pending_local = None;
                self.set_signaling_state(SignalingState::Stable);
            }
        }

        self.pump(now);
        Ok(())
    }

    /// Apply a remote description
    pub fn set_remote_description(
        &mut self,
        now: Instant,
        kind: SdpType,
        sdp: SessionDescription,
    ) -> Result<(), Error> {
        if self.closed {
            return Err(Error::InvalidState {
                state: self.signaling_state,
            });
        }

        match kind {
            SdpType::Offer => {
                self.require_transition(
                    kind,
                    &[SignalingState::Stable, SignalingState::HaveRemoteOffer],
                )?;

                validate_remote_description(&sdp)?;

                self.apply_remote_offer(&sdp)?;
                self.pending_remote = Some(sdp);
                self.set_signaling_state(SignalingState::HaveRemoteOffer);
            }
            SdpType::Answer => {
                self.require_transition(
                    kind,
                    &[SignalingState::HaveLocalOffer, SignalingState::HaveRemotePranswer],
                )?;

                validate_remote_description(&sdp)?;

                self.apply_remote_answer(now, sdp)?;
                self.set_signaling_state(SignalingState::Stable);
            }
            SdpType::Pranswer => {
                self.require_transition(kind, &[SignalingState::HaveLocalOffer])?;

                validate_remote_description(&sdp)?;

                self.pending_remote = Some(sdp);
                self.set_signaling_state(SignalingState::HaveRemotePranswer);
            }
            SdpType::Rollback => {
                self.require_transition(kind, &[SignalingState::HaveRemoteOffer])?;

                self.rollback_remote_offer();
                self.pending_remote = None;
                self.set_signaling_state(SignalingState::Stable);
            }
        }

        self.pump(now);
        Ok(())
    }

    /// Add a trickled remote ICE candidate
    pub fn add_ice_candidate(&mut self, candidate: &str) -> Result<(), Error> {
        if self.current_remote.is_none() && self.pending_remote.is_none() {
            return Err(Error::NoRemoteDescription);
        }

        let candidate = candidate.strip_prefix("candidate:").unwrap_or(candidate);

        let src = bytes::Bytes::copy_from_slice(candidate.as_bytes());
        let input = std::str::from_utf8(&src).expect("src was created from a str");

        match sdp_types::IceCandidate::parse(&src, input) {
            Ok((_, candidate)) => {
                self.transport.ice_mut().add_remote_candidate(&candidate);
            }
            Err(e) => {
                log::warn!("Ignoring unparsable ICE candidate: {e:?}");
            }
        }

        Ok(())
    }

    /// Close the connection, tearing down all child components
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        self.closed = true;

        self.sctp.close();

        while let Some(event) = self.sctp.pop_event() {
            if let SctpEvent::ChannelStateChanged(id, state) = event {
                self.events
                    .push_back(PeerConnectionEvent::DataChannelStateChange(id, state));
            }
        }

        self.set_signaling_state(SignalingState::Closed);
        self.set_connection_state(ConnectionState::Closed);
    }

    // ==== Driving

    /// Returns the duration after which [`poll`](Self::poll) must be called
    pub fn timeout(&mut self, now: Instant) -> Option<Duration> {
        if self.closed {
            return None;
        }

        let mut timeout = self.transport.timeout(now);
        timeout = opt_min(timeout, self.sctp.timeout(now));

        for transceiver in &self.transceivers {
            timeout = opt_min(timeout, transceiver.sender().timeout(now));
            timeout = opt_min(timeout, transceiver.receiver().timeout(now));
        }

        timeout
    }

    /// Drive progress: timers, handshakes, reports and pending IO
    pub fn poll(&mut self, now: Instant) {
        if self.closed {
            return;
        }

        self.transport.poll(now);
        self.sctp.poll(now);

        // Release packets whose jitter buffer deadline passed and collect
        // due RTCP reports
        let mut reports = ReportsQueue::new();
        let mut received = vec![];

        for transceiver in &mut self.transceivers {
            let id = transceiver.id();

            for ready in transceiver.receiver_mut().poll(now) {
                received.push((id, ready));
            }

            transceiver.sender_mut().collect_reports(now, &mut reports);
            transceiver.receiver_mut().collect_reports(now, &mut reports);
        }

        for (id, ready) in received {
            self.emit_rtp(id, ready);
        }

        while let Some(report) = reports.make_report(self.fallback_ssrc, self.config.mtu) {
            self.transport.send_rtcp(report);
        }

        self.pump(now);
    }

    /// Hand a received datagram to the connection
    pub fn receive(&mut self, now: Instant, pkt: ReceivedPkt) {
        if self.closed {
            return;
        }

        for data in self.transport.receive(now, pkt) {
            match data {
                ReceivedData::Rtp(packet) => self.handle_rtp(now, packet),
                ReceivedData::Rtcp(data) => self.handle_rtcp(now, data),
                ReceivedData::Sctp(data) => self.sctp.receive(now, data),
            }
        }

        self.pump(now);
    }

    /// Pop the next event
    pub fn pop_event(&mut self) -> Option<PeerConnectionEvent> {
        self.events.pop_front()
    }

    // ==== Internal: packet handling

    fn handle_rtp(&mut self, now: Instant, packet: RtpPacket) {
        let Some(mid) = self.transport.demux().resolve(&packet) else {
            log::warn!(
                "RTP packet with ssrc={} cannot be mapped to any media section, dropping",
                packet.ssrc.0
            );
            return;
        };

        let Some(transceiver) = self
            .transceivers
            .iter_mut()
            .find(|t| t.mid() == Some(mid.as_str()))
        else {
            log::warn!("RTP packet resolved to unknown mid {mid}, dropping");
            return;
        };

        if !direction_includes_recv(transceiver.current_direction()) {
            log::debug!("Dropping RTP packet for non-receiving transceiver");
            return;
        }

        let id = transceiver.id();

        for ready in transceiver.receiver_mut().receive(now, packet) {
            self.emit_rtp(id, ready);
        }
    }

    fn emit_rtp(&mut self, id: TransceiverId, ready: crate::transceiver::ReceivedRtp) {
        let rid = ready
            .rid
            .as_ref()
            .map(|rid| String::from_utf8_lossy(rid).into_owned());

        self.events.push_back(PeerConnectionEvent::Rtp {
            transceiver_id: id,
            rid,
            packet: ready.packet,
        });
    }

    fn handle_rtcp(&mut self, now: Instant, data: Vec<u8>) {
        let compound = match Compound::parse(&data) {
            Ok(compound) => compound,
            Err(e) => {
                log::warn!("Failed to parse incoming RTCP packet: {e}");
                return;
            }
        };

        let mut rtx = vec![];

        for packet in compound {
            let packet = match packet {
                Ok(packet) => packet,
                Err(e) => {
                    log::warn!("Failed to parse RTCP packet in compound packet, {e}");
                    break;
                }
            };

            match packet {
                Packet::Rr(receiver_report) => {
                    for block in receiver_report.report_blocks() {
                        if let Some(t) = self.transceiver_by_sender_ssrc(Ssrc(block.ssrc())) {
                            t.sender_mut().handle_report_block(now, block);
                        }
                    }
                }
                Packet::Sr(sender_report) => {
                    if let Some(t) = self.transceiver_by_receiver_ssrc(Ssrc(sender_report.ssrc())) {
                        t.receiver_mut().handle_sender_report(now, &sender_report);
                    }

                    for block in sender_report.report_blocks() {
                        if let Some(t) = self.transceiver_by_sender_ssrc(Ssrc(block.ssrc())) {
                            t.sender_mut().handle_report_block(now, block);
                        }
                    }
                }
                Packet::TransportFeedback(feedback) => {
                    if let Ok(nack) = feedback.parse_fci::<Nack>() {
                        let media_ssrc = Ssrc(feedback.media_ssrc());

                        if let Some(t) = self.transceiver_by_sender_ssrc(media_ssrc) {
                            rtx.extend(t.sender_mut().handle_nack(nack.entries()));
                        }
                    }
                }
                Packet::PayloadFeedback(feedback) => {
                    if feedback.parse_fci::<Pli>().is_ok() {
                        let media_ssrc = Ssrc(feedback.media_ssrc());

                        if let Some(t) = self.transceiver_by_sender_ssrc(media_ssrc) {
                            t.sender_mut().handle_pli();
                        }
                    }
                }
                _ => {}
            }
        }

        for packet in rtx {
            self.transport.send_rtp(&packet);
        }

        self.events.push_back(PeerConnectionEvent::Rtcp(data));
    }

    fn transceiver_by_sender_ssrc(&mut self, ssrc: Ssrc) -> Option<&mut Transceiver> {
        self.transceivers
            .iter_mut()
            .find(|t| t.sender().ssrc() == ssrc || t.sender().rtx_ssrc() == ssrc)
    }

    fn transceiver_by_receiver_ssrc(&mut self, ssrc: Ssrc) -> Option<&mut Transceiver> {
        self.transceivers
            .iter_mut()
            .find(|t| t.receiver().matches_ssrc(ssrc))
    }

    // ==== Internal: event pumping

    /// Drain child component events until everything settles
    fn pump(&mut self, now: Instant) {
        loop {
            if let Some(event) = self.transport.pop_event() {
                self.handle_transport_event(now, event);
                continue;
            }

            if let Some(event) = self.sctp.pop_event() {
                self.handle_sctp_event(event);
                continue;
            }

            break;
        }

        self.emit_new_candidates();
    }

    fn handle_transport_event(&mut self, now: Instant, event: TransportEvent) {
        match event {
            TransportEvent::SendData {
                data,
                source,
                target,
            } => self.events.push_back(PeerConnectionEvent::SendData {
                data,
                source,
                target,
            }),
            TransportEvent::IceGatheringState { .. } => {}
            TransportEvent::IceConnectionState { .. } => self.update_connection_state(),
            TransportEvent::ConnectionState { new, .. } => {
                if new == TransportConnectionState::Connected
                    && let Some(role) = self.transport.dtls_role()
                {
                    self.sctp.start(now, role);
                }

                self.update_connection_state();
            }
        }
    }

    fn handle_sctp_event(&mut self, event: SctpEvent) {
        match event {
            SctpEvent::Transmit(data) => self.transport.send_sctp(&data),
            SctpEvent::IncomingChannel(id) => {
                self.events.push_back(PeerConnectionEvent::DataChannel(id));
            }
            SctpEvent::ChannelStateChanged(id, state) => {
                self.events
                    .push_back(PeerConnectionEvent::DataChannelStateChange(id, state));
            }
            SctpEvent::Data(id, payload) => {
                self.events.push_back(PeerConnectionEvent::Data(id, payload));
            }
            SctpEvent::Failed => self.fail(),
        }
    }

    fn emit_new_candidates(&mut self) {
        let candidates = self.transport.ice().ice_candidates();

        for candidate in candidates.iter().skip(self.candidates_emitted) {
            self.events
                .push_back(PeerConnectionEvent::IceCandidate(format!(
                    "candidate:{candidate}"
                )));
        }

        self.candidates_emitted = candidates.len();
    }

    fn update_connection_state(&mut self) {
        if self.closed {
            return;
        }

        if matches!(
            self.connection_state,
            ConnectionState::Failed | ConnectionState::Closed
        ) {
            return;
        }

        let ice = self.transport.ice().connection_state();

        let new = match (self.transport.connection_state(), ice) {
            (TransportConnectionState::Failed, _) | (_, IceConnectionState::Failed) => {
                ConnectionState::Failed
            }
            (_, IceConnectionState::Disconnected) => ConnectionState::Disconnected,
            (TransportConnectionState::Connected, _) => ConnectionState::Connected,
            (TransportConnectionState::Connecting, _) | (_, IceConnectionState::Checking) => {
                ConnectionState::Connecting
            }
            (TransportConnectionState::Closed, _) => ConnectionState::Closed,
            _ => ConnectionState::New,
        };

        self.set_connection_state(new);
    }

    fn set_connection_state(&mut self, new: ConnectionState) {
        if self.connection_state != new {
            self.connection_state = new;
            self.events
                .push_back(PeerConnectionEvent::ConnectionStateChange(new));
        }
    }

    fn set_signaling_state(&mut self, new: SignalingState) {
        if self.signaling_state != new {
            self.signaling_state = new;
            self.events
                .push_back(PeerConnectionEvent::SignalingStateChange(new));
        }
    }

    fn fail(&mut self) {
        if !matches!(
            self.connection_state,
            ConnectionState::Failed | ConnectionState::Closed
        ) {
            self.set_connection_state(ConnectionState::Failed);
        }
    }

    fn mark_negotiation_needed(&mut self) {
        if self.signaling_state == SignalingState::Stable && !self.negotiation_needed {
            self.negotiation_needed = true;
            self.events.push_back(PeerConnectionEvent::NegotiationNeeded);
        }
    }

    fn require_transition(&self, kind: SdpType, valid: &[SignalingState]) -> Result<(), Error> {
        if valid.contains(&self.signaling_state) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                state: self.signaling_state,
                kind,
            })
        }
    }

    // ==== Internal: ICE

    fn restart_ice(&mut self) {
        self.local_credentials = IceCredentials::random();

        let mut ice = IceAgent::new_for_offer(self.local_credentials.clone(), true, true);

        for addr in &self.host_addrs {
            ice.add_host_addr(Component::Rtp, *addr);
        }

        for server in &self.stun_servers {
            ice.add_stun_server(*server);
        }

        self.candidates_emitted = 0;
        self.remote_ice_set = false;
        self.transport.replace_ice(ice);
    }

    /// Install the remote ICE credentials & candidates after a negotiation
    fn setup_remote_ice(&mut self, remote: &SessionDescription, controlling: bool) {
        let Ok((ufrag, pwd)) = remote_ice_credentials(remote) else {
            // Checked during validation
            return;
        };

        let credentials = IceCredentials { ufrag, pwd };

        let candidates: Vec<_> = remote
            .media_descriptions
            .iter()
            .flat_map(|m| m.ice_candidates.iter().cloned())
            .collect();

        if self.remote_ice_set {
            self.transport
                .ice_mut()
                .set_remote_data(credentials, &candidates, true);
            return;
        }

        if controlling {
            // The agent was created for our offer, it only lacks the
            // remote's half
            self.transport
                .ice_mut()
                .set_remote_data(credentials, &candidates, true);
        } else {
            // Answer side: rebuild the agent in the controlled role
            let mut ice = IceAgent::new_from_answer(
                self.local_credentials.clone(),
                credentials,
                false,
                true,
            );

            for addr in &self.host_addrs {
                ice.add_host_addr(Component::Rtp, *addr);
            }

            for server in &self.stun_servers {
                ice.add_stun_server(*server);
            }

            for candidate in &candidates {
                ice.add_remote_candidate(candidate);
            }

            self.candidates_emitted = 0;
            self.transport.replace_ice(ice);
        }

        self.remote_ice_set = true;
    }

    // ==== Internal: applying descriptions

    /// Associate transceivers with the m-lines of our own offer
    fn associate_from_local_offer(&mut self, offer: &SessionDescription) {
        for (index, media_desc) in offer.media_descriptions.iter().enumerate() {
            let Some(mid) = &media_desc.mid else {
                continue;
            };

            if sdp::is_data_media(media_desc) {
                if let Some(data_section) = &mut self.data_section {
                    data_section.mline_index = Some(index);
                }
                continue;
            }

            if let Some(transceiver) = self
                .transceivers
                .iter_mut()
                .find(|t| t.mid() == Some(mid.as_str()))
            {
                transceiver.associate(index);
                self.free_slots.retain(|slot| slot.mline_index != index);
            }
        }
    }

    /// Reconcile the transceiver set with a remote offer
    fn apply_remote_offer(&mut self, offer: &SessionDescription) -> Result<(), Error> {
        self.provisional.clear();

        for (index, remote_desc) in offer.media_descriptions.iter().enumerate() {
            if sdp::is_data_media(remote_desc) {
                if remote_desc.media.port != 0 {
                    if self.data_section.is_none() {
                        self.data_section = Some(DataSection {
                            mid: remote_desc
                                .mid
                                .clone()
                                .ok_or(Error::MissingMid { mline: index })?,
                            mline_index: Some(index),
                        });
                    }

                    if let Some(port) = sdp::read_sctp_port(remote_desc) {
                        self.sctp.set_remote_port(port);
                    }
                }
                continue;
            }

            let Some(kind) = MediaKind::from_media_type(remote_desc.media.media_type) else {
                // Media we cannot carry keeps occupying its slot
                self.note_foreign_slot(index, remote_desc);
                continue;
            };

            let local_codecs = self.config_codecs(kind).clone();

            // 1. A transceiver already owning this mid (or m-line)
            let matched = self.transceivers.iter_mut().find(|t| {
                (t.mid().is_some() && t.mid() == remote_desc.mid.as_deref())
                    || t.mline_index() == Some(index)
            });

            if let Some(transceiver) = matched {
                update_transceiver_from_remote(transceiver, &local_codecs, offer, remote_desc);

                if remote_desc.media.port == 0 || remote_desc.direction == Direction::Inactive {
                    transceiver.stop();
                }

                continue;
            }

            if remote_desc.media.port == 0 {
                // A zeroed slot the remote keeps around
                self.note_foreign_slot(index, remote_desc);
                continue;
            }

            let Some(mid) = remote_desc.mid.clone() else {
                return Err(Error::MissingMid { mline: index });
            };

            // 2. An unassociated transceiver added by add_track
            let associable = self.transceivers.iter_mut().find(|t| {
                t.added_by_add_track
                    && t.kind() == kind
                    && t.mid().is_none()
                    && !t.stopped()
                    && matches!(t.direction(), Direction::SendRecv | Direction::RecvOnly)
            });

            let transceiver = if let Some(transceiver) = associable {
                transceiver
            } else {
                // 3. A fresh recvonly transceiver for the new remote media
                let id = self.make_transceiver(kind, Direction::RecvOnly);
                self.provisional.push(id);

                self.transceivers
                    .iter_mut()
                    .find(|t| t.id() == id)
                    .expect("transceiver was just created")
            };

            transceiver.set_mid(mid);
            transceiver.associate(index);

            update_transceiver_from_remote(transceiver, &local_codecs, offer, remote_desc);

            if remote_desc.direction == Direction::Inactive {
                transceiver.stop();
            }

            self.free_slots.retain(|slot| slot.mline_index != index);
        }

        self.fire_track_events(offer);

        self.setup_remote_ice(offer, false);

        Ok(())
    }

    /// Remember a remote m-line we do not own a transceiver for, so later
    /// offers keep the m-line count stable
    fn note_foreign_slot(&mut self, index: usize, remote_desc: &MediaDescription) {
        if self.free_slots.iter().any(|slot| slot.mline_index == index) {
            return;
        }

        self.free_slots.push(FreeSlot {
            mline_index: index,
            media_type: remote_desc.media.media_type,
            fmts: if remote_desc.media.fmts.is_empty() {
                vec![0]
            } else {
                remote_desc.media.fmts.clone()
            },
        });
    }

    fn rollback_remote_offer(&mut self) {
        let provisional = std::mem::take(&mut self.provisional);

        self.transceivers.retain(|t| !provisional.contains(&t.id()));
    }

    /// Complete the negotiation as the offerer
    fn apply_remote_answer(
        &mut self,
        now: Instant,
        answer: SessionDescription,
    ) -> Result<(), Error> {
        for (index, remote_desc) in answer.media_descriptions.iter().enumerate() {
            if sdp::is_data_media(remote_desc)
                || self
                    .data_section
                    .as_ref()
                    .is_some_and(|d| d.mline_index == Some(index))
            {
                if remote_desc.media.port == 0 {
                    log::debug!("Peer rejected the data channel media section");
                    self.data_section = None;
                } else if let Some(port) = sdp::read_sctp_port(remote_desc) {
                    self.sctp.set_remote_port(port);
                }
                continue;
            }

            let Some(transceiver) = self
                .transceivers
                .iter_mut()
                .find(|t| t.mline_index() == Some(index))
            else {
                continue;
            };

            if remote_desc.media.port == 0 {
                transceiver.stop();
                continue;
            }

            let kind = transceiver.kind();
            let codecs = match kind {
                MediaKind::Audio => negotiate_codecs(&self.config.audio_codecs, remote_desc),
                MediaKind::Video => negotiate_codecs(&self.config.video_codecs, remote_desc),
            };

            if codecs.is_empty() {
                transceiver.stop();
                continue;
            }

            transceiver.set_negotiated_codecs(codecs);
            transceiver.set_extension_ids(RtpExtensionIds::from_sdp(&answer, remote_desc));
            seed_remote_ssrcs(transceiver, remote_desc);

            // The answer's direction is from the answerer's point of view
            transceiver.set_current_direction(remote_desc.direction.flipped());
        }

        self.fire_track_events(&answer);

        self.setup_remote_ice(&answer, true);

        // We offered actpass; the answerer picked its role
        let role = match remote_setup(&answer) {
            Some(Setup::Active) => DtlsRole::Server,
            Some(Setup::Passive) => DtlsRole::Client,
            _ => {
                log::warn!("Answer has no usable setup attribute, assuming active peer");
                DtlsRole::Server
            }
        };

        self.current_remote = Some(answer);
        self.pending_remote = None;
        self.current_local = self.pending_local.take().or(self.current_local.take());

        self.complete_negotiation(now, role)
    }

    /// Complete the negotiation as the answerer
    fn apply_local_answer(&mut self, now: Instant, answer: SessionDescription) -> Result<(), Error> {
        for (index, local_desc) in answer.media_descriptions.iter().enumerate() {
            let Some(transceiver) = self
                .transceivers
                .iter_mut()
                .find(|t| t.mline_index() == Some(index))
            else {
                continue;
            };

            if local_desc.media.port == 0 {
                if !transceiver.stopping() {
                    transceiver.stop();
                }
                continue;
            }

            transceiver.set_current_direction(local_desc.direction);
        }

        let remote = self
            .pending_remote
            .take()
            .ok_or(Error::NoRemoteDescription)?;

        self.setup_remote_ice(&remote, false);

        // We answer with setup:active and connect as the DTLS client
        let role = DtlsRole::Client;

        self.current_remote = Some(remote);
        self.current_local = Some(answer);
        self.pending_local = None;
        self.provisional.clear();

        self.complete_negotiation(now, role)
    }

    /// Steps shared by both sides once an answer has been applied: remove
    /// stopped transceivers, finalize the demuxer, start DTLS and surface
    /// direction changes
    fn complete_negotiation(&mut self, now: Instant, role: DtlsRole) -> Result<(), Error> {
        let mut reports = ReportsQueue::new();

        // Remove transceivers that were stopped or rejected; their streams
        // say goodbye
        let mut removed = vec![];

        for transceiver in &mut self.transceivers {
            if transceiver.stopping() {
                transceiver.mark_stopped();
                transceiver.sender_mut().bye(&mut reports);
            }
        }

        self.transceivers.retain(|t| {
            if t.stopped() {
                removed.push((t.id(), t.fired_direction(), t.mline_index(), t.kind()));
                false
            } else {
                true
            }
        });

        for (id, fired, mline_index, kind) in removed {
            if direction_includes_recv(fired) {
                self.events.push_back(PeerConnectionEvent::TrackEnded(id));
            }

            if let Some(mline_index) = mline_index {
                self.free_slots.push(FreeSlot {
                    mline_index,
                    media_type: kind.media_type(),
                    fmts: vec![0],
                });
            }
        }

        // Mute tracks whose negotiated direction no longer includes receiving
        for transceiver in &mut self.transceivers {
            let fired_recv = direction_includes_recv(transceiver.fired_direction());
            let current_recv = direction_includes_recv(transceiver.current_direction());

            if fired_recv && !current_recv {
                self.events
                    .push_back(PeerConnectionEvent::TrackMuted(transceiver.id()));
                transceiver.set_fired_direction(transceiver.current_direction());
            }
        }

        while let Some(report) = reports.make_report(self.fallback_ssrc, self.config.mtu) {
            self.transport.send_rtcp(report);
        }

        self.rebuild_demuxer();

        // Kick off the DTLS handshake; its first flight waits for ICE
        let remote_fingerprint = self
            .current_remote
            .as_ref()
            .map(remote_sha256_fingerprint)
            .transpose()?
            .ok_or(Error::MissingCertFingerprint)?;

        for data in self
            .transport
            .start_dtls(&self.identity, role, remote_fingerprint, self.config.mtu)
        {
            if let ReceivedData::Sctp(data) = data {
                self.sctp.receive(now, data);
            }
        }

        self.session_version += 1;
        self.negotiation_needed = false;
        self.update_connection_state();

        if self.connection_state == ConnectionState::New {
            self.set_connection_state(ConnectionState::Connecting);
        }

        Ok(())
    }

    /// Emit `track` events for every transceiver the remote will send on
    fn fire_track_events(&mut self, remote: &SessionDescription) {
        let mut events = vec![];

        for transceiver in &mut self.transceivers {
            let Some(index) = transceiver.mline_index() else {
                continue;
            };

            let Some(remote_desc) = remote.media_descriptions.get(index) else {
                continue;
            };

            if remote_desc.media.port == 0 {
                continue;
            }

            // The remote sends if its direction includes sending
            let remote_sends = matches!(
                remote_desc.direction,
                Direction::SendRecv | Direction::SendOnly
            );

            if remote_sends && !direction_includes_recv(transceiver.fired_direction()) {
                events.push(PeerConnectionEvent::Track {
                    transceiver_id: transceiver.id(),
                    track: transceiver.receiver().track().clone(),
                });

                transceiver.set_fired_direction(Some(remote_desc.direction.flipped()));
            }
        }

        self.events.extend(events);
    }

    fn rebuild_demuxer(&mut self) {
        let extension_ids = self
            .transceivers
            .first()
            .map(|t| t.extension_ids())
            .unwrap_or_else(RtpExtensionIds::offer);

        let entries: Vec<_> = self
            .transceivers
            .iter()
            .filter_map(|t| {
                let mid = BytesStr::from(t.mid()?);

                let pts = t
                    .codecs()
                    .iter()
                    .flat_map(|c| [Some(c.pt), c.rtx_pt])
                    .flatten()
                    .collect();

                let ssrcs = t
                    .receiver()
                    .observed_ssrc()
                    .into_iter()
                    .map(|ssrc| ssrc.0)
                    .collect();

                Some(DemuxEntry { mid, pts, ssrcs })
            })
            .collect();

        self.transport.demux().rebuild(extension_ids, entries);
    }

    // ==== Internal: building descriptions

    /// Assign mids to transceivers (and the data section) that lack one:
    /// the smallest integer above every mid seen so far
    fn assign_mids(&mut self) {
        let mut next = self.max_seen_mid().map(|m| m + 1).unwrap_or(0);

        let needs_data_mid = self.sctp.has_channels() && self.data_section.is_none();

        for transceiver in &mut self.transceivers {
            if transceiver.mid().is_none() {
                transceiver.set_mid(BytesStr::from(next.to_string()));
                next += 1;
            }
        }

        if needs_data_mid {
            self.data_section = Some(DataSection {
                mid: BytesStr::from(next.to_string()),
                mline_index: None,
            });
        }
    }

    fn max_seen_mid(&self) -> Option<u64> {
        let local = self
            .transceivers
            .iter()
            .filter_map(|t| t.mid())
            .chain(self.data_section.as_ref().map(|d| d.mid.as_str()));

        let remote = self
            .remote_description()
            .into_iter()
            .flat_map(|desc| desc.media_descriptions.iter())
            .filter_map(|m| m.mid.as_deref());

        local
            .chain(remote)
            .filter_map(|mid| mid.parse::<u64>().ok())
            .max()
    }

    /// Lay out the m-lines for an offer: associated sections keep their
    /// index, new transceivers recycle free slots lowest-index first, the
    /// rest is appended
    fn plan_sections(&self) -> Vec<PlannedSection<'_>> {
        let max_index = self
            .transceivers
            .iter()
            .filter_map(|t| t.mline_index())
            .chain(self.free_slots.iter().map(|slot| slot.mline_index))
            .chain(
                self.data_section
                    .as_ref()
                    .and_then(|d| d.mline_index),
            )
            .max();

        let len = max_index.map(|i| i + 1).unwrap_or(0);

        let mut sections: Vec<Option<PlannedSection<'_>>> = (0..len).map(|_| None).collect();

        for slot in &self.free_slots {
            sections[slot.mline_index] = Some(PlannedSection::Free {
                media_type: slot.media_type,
                fmts: slot.fmts.clone(),
            });
        }

        for transceiver in &self.transceivers {
            if let Some(index) = transceiver.mline_index() {
                sections[index] = Some(PlannedSection::Transceiver(transceiver));
            }
        }

        if let Some(data_section) = &self.data_section
            && let Some(index) = data_section.mline_index
        {
            sections[index] = Some(PlannedSection::Data);
        }

        let mut sections: Vec<PlannedSection<'_>> = sections
            .into_iter()
            .map(|section| {
                section.unwrap_or(PlannedSection::Free {
                    media_type: MediaType::Audio,
                    fmts: vec![0],
                })
            })
            .collect();

        // New transceivers take the lowest-indexed free slot, regardless of
        // the slot's previous media kind
        for transceiver in &self.transceivers {
            if transceiver.mline_index().is_some() {
                continue;
            }

            let free = sections
                .iter()
                .position(|s| matches!(s, PlannedSection::Free { .. }));

            match free {
                Some(index) => sections[index] = PlannedSection::NewTransceiver(transceiver),
                None => sections.push(PlannedSection::NewTransceiver(transceiver)),
            }
        }

        if self
            .data_section
            .as_ref()
            .is_some_and(|d| d.mline_index.is_none())
        {
            sections.push(PlannedSection::Data);
        }

        sections
    }

    fn session_description(
        &self,
        media_descriptions: Vec<MediaDescription>,
        bundle_mids: Vec<BytesStr>,
    ) -> SessionDescription {
        let address: IpAddr = Ipv4Addr::UNSPECIFIED.into();

        SessionDescription {
            origin: Origin {
                username: "-".into(),
                session_id: self.session_id.to_string().into(),
                session_version: self.session_version.to_string().into(),
                address: address.into(),
            },
            name: "-".into(),
            connection: Some(Connection {
                address: address.into(),
                ttl: None,
                num: None,
            }),
            bandwidth: vec![],
            time: Time { start: 0, stop: 0 },
            direction: Direction::SendRecv,
            group: vec![Group {
                typ: BytesStr::from_static("BUNDLE"),
                mids: bundle_mids,
            }],
            extmap: vec![],
            extmap_allow_mixed: true,
            ice_lite: false,
            ice_options: IceOptions {
                options: vec![BytesStr::from_static("trickle")],
            },
            ice_ufrag: Some(IceUsernameFragment {
                ufrag: self.local_credentials.ufrag.clone().into(),
            }),
            ice_pwd: Some(IcePassword {
                pwd: self.local_credentials.pwd.clone().into(),
            }),
            setup: None,
            fingerprint: vec![Fingerprint {
                algorithm: FingerprintAlgorithm::SHA256,
                fingerprint: self.fingerprint.clone(),
            }],
            attributes: vec![],
            media_descriptions,
        }
    }

    fn media_description_for_transceiver(
        &self,
        transceiver: &Transceiver,
        direction: Direction,
        first_mline: bool,
    ) -> MediaDescription {
        let mut rtpmap = vec![];
        let mut fmtp = vec![];
        let mut fmts = vec![];
        let mut attributes = vec![];

        for codec in transceiver.codecs() {
            fmts.push(codec.pt);

            rtpmap.push(RtpMap {
                payload: codec.pt,
                encoding: codec.name.as_ref().into(),
                clock_rate: codec.clock_rate,
                params: codec.channels.map(|c| c.to_string().into()),
            });

            if let Some(param) = &codec.fmtp {
                fmtp.push(Fmtp {
                    format: codec.pt,
                    params: param.as_str().into(),
                });
            }

            if let Some(rtx_pt) = codec.rtx_pt {
                fmts.push(rtx_pt);

                rtpmap.push(RtpMap {
                    payload: rtx_pt,
                    encoding: "rtx".into(),
                    clock_rate: codec.clock_rate,
                    params: None,
                });

                fmtp.push(Fmtp {
                    format: rtx_pt,
                    params: format!("apt={}", codec.pt).into(),
                });
            }
        }

        let mut ssrc = vec![];

        let sends = matches!(direction, Direction::SendRecv | Direction::SendOnly);

        if sends {
            let sender = transceiver.sender();

            if let Some(track) = sender.track() {
                let stream_id = track
                    .stream_ids
                    .first()
                    .map(String::as_str)
                    .unwrap_or("-");

                attributes.push(unknown_attr("msid", format!("{stream_id} {}", track.id)));
            }

            let cname = BytesStr::from(self.cname.as_str());

            ssrc.push(sdp_types::Ssrc {
                ssrc: sender.ssrc().0,
                attribute: SourceAttribute::CName {
                    cname: cname.clone(),
                },
            });

            let has_rtx = transceiver.codecs().iter().any(|c| c.rtx_pt.is_some());

            if has_rtx {
                ssrc.push(sdp_types::Ssrc {
                    ssrc: sender.rtx_ssrc().0,
                    attribute: SourceAttribute::CName { cname },
                });

                attributes.push(unknown_attr(
                    "ssrc-group",
                    format!("FID {} {}", sender.ssrc().0, sender.rtx_ssrc().0),
                ));
            }
        }

        for codec in transceiver.codecs() {
            push_feedback(&mut attributes, codec.pt, &codec.feedback);
        }

        let mut desc = MediaDescription {
            media: Media {
                media_type: transceiver.kind().media_type(),
                port: 9,
                ports_num: None,
                proto: TransportProtocol::UdpTlsRtpSavpf,
                fmts,
            },
            connection: None,
            bandwidth: vec![],
            direction,
            rtcp: None,
            rtcp_mux: true,
            rtcp_rsize: false,
            mid: transceiver.mid().map(BytesStr::from),
            msid: None,
            rtpmap,
            fmtp,
            rtcp_fb: vec![],
            ice_ufrag: None,
            ice_pwd: None,
            ice_candidates: vec![],
            ice_end_of_candidates: false,
            crypto: vec![],
            extmap: transceiver.extension_ids().to_extmap(),
            extmap_allow_mixed: false,
            ssrc,
            setup: Some(self.local_setup()),
            fingerprint: vec![],
            imageattr: vec![],
            attributes,
        };

        if first_mline {
            desc.ice_candidates = self.transport.ice().ice_candidates();
        }

        desc
    }

    /// The `a=setup` value for local descriptions: offers are always
    /// `actpass`, answers always pick `active` (DTLS client)
    fn local_setup(&self) -> Setup {
        match self.signaling_state {
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer => Setup::Active,
            _ => Setup::ActPass,
        }
    }

    /// Media section of a stopping or rejected transceiver: port zero, but
    /// the slot stays visible
    fn rejected_media_description(&self, transceiver: &Transceiver) -> MediaDescription {
        let fmts = if transceiver.codecs().is_empty() {
            vec![0]
        } else {
            transceiver.codecs().iter().map(|c| c.pt).collect()
        };

        let mut desc = MediaDescription::rejected(transceiver.kind().media_type());
        desc.media.fmts = fmts;
        desc.media.proto = TransportProtocol::UdpTlsRtpSavpf;
        desc.mid = transceiver.mid().map(BytesStr::from);
        desc
    }

    fn data_media_description(&self, first_mline: bool) -> MediaDescription {
        let mut desc = MediaDescription::rejected(MediaType::App);

        // `sdp-types` cannot express the non-numeric format token of the
        // application m-line, smuggle it through the transport protocol
        desc.media.port = 9;
        desc.media.proto =
            TransportProtocol::Other(BytesStr::from_static("UDP/DTLS/SCTP webrtc-datachannel"));
        desc.mid = self.data_section.as_ref().map(|d| d.mid.clone());
        desc.setup = Some(self.local_setup());
        desc.attributes
            .push(unknown_attr("sctp-port", sdp::SCTP_PORT.to_string()));
        desc.attributes
            .push(unknown_attr("max-message-size", "65536".into()));

        if first_mline {
            desc.ice_candidates = self.transport.ice().ice_candidates();
        }

        desc
    }
}

fn direction_includes_recv(direction: Option<Direction>) -> bool {
    matches!(direction, Some(Direction::SendRecv | Direction::RecvOnly))
}

fn direction_includes_send(direction: Option<Direction>) -> bool {
    matches!(direction, Some(Direction::SendRecv | Direction::SendOnly))
}

/// Zeroed m-line for a slot whose transceiver is gone
fn zeroed_media_description(media_type: MediaType, fmts: Vec<u8>) -> MediaDescription {
    let mut desc = MediaDescription::rejected(media_type);
    desc.media.fmts = fmts;
    desc.media.proto = TransportProtocol::UdpTlsRtpSavpf;
    desc
}

/// Echo a rejected (or unsupported) remote media section in the answer
fn rejected_remote_media_description(remote_desc: &MediaDescription) -> MediaDescription {
    let mut desc = MediaDescription::rejected(remote_desc.media.media_type);
    desc.media.fmts = remote_desc.media.fmts.clone();
    desc.media.proto = remote_desc.media.proto.clone();
    desc.mid = remote_desc.mid.clone();
    desc
}

fn remote_setup(desc: &SessionDescription) -> Option<Setup> {
    desc.setup.or_else(|| {
        desc.media_descriptions
            .iter()
            .find_map(|media_desc| media_desc.setup)
    })
}

/// Update a transceiver with what a remote description offers: codecs,
/// extension ids and declared SSRCs
fn update_transceiver_from_remote(
    transceiver: &mut Transceiver,
    local_codecs: &Codecs,
    session_desc: &SessionDescription,
    remote_desc: &MediaDescription,
) {
    let codecs = negotiate_codecs(local_codecs, remote_desc);
    transceiver.set_negotiated_codecs(codecs);
    transceiver.set_extension_ids(RtpExtensionIds::from_sdp(session_desc, remote_desc));
    seed_remote_ssrcs(transceiver, remote_desc);

    if let Some((stream_id, track_id)) = sdp::read_msid(remote_desc) {
        transceiver
            .receiver_mut()
            .update_track_ids(stream_id, track_id);
    }
}

fn seed_remote_ssrcs(transceiver: &mut Transceiver, remote_desc: &MediaDescription) {
    if let Some(first) = remote_desc.ssrc.first() {
        transceiver.receiver_mut().seed_ssrc(Ssrc(first.ssrc));
    }
}

/// Assign payload types from the dynamic range to all configured codecs
fn assign_payload_types(config: &mut RtcConfig) {
    let mut next_pt = 96u8;

    let mut assign = |codecs: &mut Codecs| {
        for codec in &mut codecs.codecs {
            if codec.pt.is_none() {
                codec.pt = Some(next_pt);
                next_pt += 1;
            }

            if codec.allow_rtx && codec.rtx_pt.is_none() {
                codec.rtx_pt = Some(next_pt);
                next_pt += 1;
            }
        }
    };

    assign(&mut config.audio_codecs);
    assign(&mut config.video_codecs);
}
