//! The bundled transport under all media sections and the data channel
//!
//! Owns the ICE agent and the DTLS endpoint, classifies every received
//! datagram, protects/unprotects SRTP and keeps the demultiplexing tables.
//! All media and data of a peer connection runs over this one transport
//! (BUNDLE); outbound packets become [`TransportEvent::SendData`] events.

use crate::{
    DtlsIdentity, Mtu, opt_min,
    rtp::RtpPacket,
};
use dtls::{DtlsEndpoint, DtlsRole, DtlsState};
use ice::{Component, IceAgent, IceConnectionState, IceGatheringState, ReceivedPkt};
use openssl::hash::MessageDigest;
use packet_kind::PacketKind;
use std::{
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

pub(crate) mod demux;
pub(crate) mod dtls;
mod packet_kind;

pub(crate) use demux::{DemuxEntry, RtpDemuxer};

/// Connection state of the bundled transport, driven by ICE and DTLS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportConnectionState {
    New,
    Connecting,
    Connected,
    Closed,
    Failed,
}

#[derive(Debug)]
pub(crate) enum TransportEvent {
    IceGatheringState {
        old: IceGatheringState,
        new: IceGatheringState,
    },
    IceConnectionState {
        old: IceConnectionState,
        new: IceConnectionState,
    },
    ConnectionState {
        old: TransportConnectionState,
        new: TransportConnectionState,
    },
    SendData {
        data: Vec<u8>,
        source: Option<IpAddr>,
        target: SocketAddr,
    },
}

/// Data extracted from one received datagram
pub(crate) enum ReceivedData {
    Rtp(RtpPacket),
    Rtcp(Vec<u8>),
    /// Decrypted DTLS application data, i.e. a SCTP packet
    Sctp(Vec<u8>),
}

pub(crate) struct BundleTransport {
    ice: IceAgent,
    dtls: Option<DtlsEndpoint>,
    demux: RtpDemuxer,

    state: TransportConnectionState,
    events: VecDeque<TransportEvent>,

    /// DTLS records received before the handshake endpoint exists (the
    /// answer has not been applied yet)
    backlog: Vec<Vec<u8>>,
}

impl BundleTransport {
    pub(crate) fn new(ice: IceAgent) -> Self {
        BundleTransport {
            ice,
            dtls: None,
            demux: RtpDemuxer::new(),
            state: TransportConnectionState::New,
            events: VecDeque::new(),
            backlog: Vec::new(),
        }
    }

    pub(crate) fn ice(&self) -> &IceAgent {
        &self.ice
    }

    pub(crate) fn ice_mut(&mut self) -> &mut IceAgent {
        &mut self.ice
    }

    /// Replace the ICE agent (answer-side setup or ICE restart)
    pub(crate) fn replace_ice(&mut self, ice: IceAgent) {
        self.ice = ice;
    }

    pub(crate) fn demux(&mut self) -> &mut RtpDemuxer {
        &mut self.demux
    }

    pub(crate) fn connection_state(&self) -> TransportConnectionState {
        self.state
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state == TransportConnectionState::Connected
    }

    /// Start the DTLS handshake with the role derived from the negotiated
    /// `a=setup` attributes
    ///
    /// Any DTLS records which arrived early are replayed into the new
    /// endpoint.
    pub(crate) fn start_dtls(
        &mut self,
        identity: &DtlsIdentity,
        role: DtlsRole,
        remote_fingerprint: Vec<u8>,
        mtu: Mtu,
    ) -> Vec<ReceivedData> {
        if self.dtls.is_some() {
            return vec![];
        }

        let endpoint = match DtlsEndpoint::new(
            identity,
            role,
            vec![(MessageDigest::sha256(), remote_fingerprint)],
            mtu,
        ) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                log::warn!("Failed to create DTLS endpoint: {e}");
                self.set_state(TransportConnectionState::Failed);
                return vec![];
            }
        };

        self.dtls = Some(endpoint);
        self.set_state(TransportConnectionState::Connecting);

        let mut out = vec![];

        for data in std::mem::take(&mut self.backlog) {
            out.extend(self.receive_dtls(data));
        }

        self.flush_dtls();
        self.evaluate_state();

        out
    }

    pub(crate) fn dtls_role(&self) -> Option<DtlsRole> {
        self.dtls.as_ref().map(|dtls| dtls.role())
    }

    /// Hand a received datagram to the transport
    pub(crate) fn receive(&mut self, now: Instant, pkt: ReceivedPkt) -> Vec<ReceivedData> {
        match PacketKind::identify(&pkt.data) {
            PacketKind::Stun => {
                self.ice.receive(now, pkt);
                self.drain_ice_events();

                // ICE may just have found a path; release any DTLS flight
                // that was waiting for it
                self.flush_dtls();
                self.evaluate_state();

                vec![]
            }
            PacketKind::Dtls => {
                let out = if self.dtls.is_some() {
                    self.receive_dtls(pkt.data)
                } else {
                    // The answer has not been applied yet, hold on to the
                    // record instead of breaking the peer's handshake
                    if self.backlog.len() < 100 {
                        self.backlog.push(pkt.data);
                    } else {
                        log::warn!("Dropping early DTLS record, backlog is full");
                    }

                    vec![]
                };

                self.flush_dtls();
                self.evaluate_state();

                out
            }
            PacketKind::Rtp => {
                let Some(DtlsState::Connected { inbound, .. }) =
                    self.dtls.as_mut().map(|d| d.state_mut())
                else {
                    log::warn!("Got SRTP packet before the DTLS handshake completed");
                    return vec![];
                };

                let mut data = pkt.data;

                if let Err(e) = inbound.unprotect_rtp(&mut data) {
                    log::warn!("Failed to unprotect incoming RTP packet, {e}");
                    return vec![];
                }

                match RtpPacket::parse(self.demux.extension_ids(), data) {
                    Ok(packet) => vec![ReceivedData::Rtp(packet)],
                    Err(e) => {
                        log::warn!("Failed to parse incoming RTP packet, {e}");
                        vec![]
                    }
                }
            }
            PacketKind::Rtcp => {
                let Some(DtlsState::Connected { inbound, .. }) =
                    self.dtls.as_mut().map(|d| d.state_mut())
                else {
                    log::warn!("Got SRTCP packet before the DTLS handshake completed");
                    return vec![];
                };

                let mut data = pkt.data;

                if let Err(e) = inbound.unprotect_rtcp(&mut data) {
                    log::warn!("Failed to unprotect incoming RTCP packet, {e}");
                    return vec![];
                }

                vec![ReceivedData::Rtcp(data)]
            }
            PacketKind::Unknown => vec![],
        }
    }

    fn receive_dtls(&mut self, data: Vec<u8>) -> Vec<ReceivedData> {
        let dtls = self.dtls.as_mut().expect("caller checked dtls exists");

        match dtls.receive(data) {
            Ok(application_data) => application_data.into_iter().map(ReceivedData::Sctp).collect(),
            Err(e) => {
                log::warn!("DTLS receive failed: {e:?}");
                vec![]
            }
        }
    }

    /// Serialize, protect and queue an RTP packet for sending
    pub(crate) fn send_rtp(&mut self, packet: &RtpPacket) {
        let extension_ids = self.demux.extension_ids();

        let Some((local, remote)) = self.send_path() else {
            log::debug!("Dropping outbound RTP packet, transport is not connected");
            return;
        };

        let Some(DtlsState::Connected { outbound, .. }) =
            self.dtls.as_mut().map(|d| d.state_mut())
        else {
            return;
        };

        let mut data = packet.to_vec(extension_ids);

        if let Err(e) = outbound.protect_rtp(&mut data) {
            log::warn!("Failed to protect outgoing RTP packet, {e}");
            return;
        }

        self.events.push_back(TransportEvent::SendData {
            data,
            source: local,
            target: remote,
        });
    }

    pub(crate) fn send_rtcp(&mut self, mut data: Vec<u8>) {
        let Some((local, remote)) = self.send_path() else {
            log::debug!("Dropping outbound RTCP packet, transport is not connected");
            return;
        };

        let Some(DtlsState::Connected { outbound, .. }) =
            self.dtls.as_mut().map(|d| d.state_mut())
        else {
            return;
        };

        if let Err(e) = outbound.protect_rtcp(&mut data) {
            log::warn!("Failed to protect outgoing RTCP packet, {e}");
            return;
        }

        self.events.push_back(TransportEvent::SendData {
            data,
            source: local,
            target: remote,
        });
    }

    /// Send a SCTP packet as DTLS application data
    pub(crate) fn send_sctp(&mut self, data: &[u8]) {
        let Some(dtls) = &mut self.dtls else {
            log::debug!("Dropping outbound SCTP packet, DTLS has not started");
            return;
        };

        if !matches!(dtls.state(), DtlsState::Connected { .. }) {
            log::debug!("Dropping outbound SCTP packet, DTLS is not connected");
            return;
        }

        if let Err(e) = dtls.send_application_data(data) {
            log::warn!("Failed to send SCTP packet over DTLS: {e:?}");
            return;
        }

        self.flush_dtls();
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        let mut timeout = self.ice.timeout(now);

        if let Some(dtls) = &self.dtls {
            timeout = opt_min(timeout, dtls.timeout());
        }

        timeout
    }

    pub(crate) fn poll(&mut self, now: Instant) {
        self.ice.poll(now);
        self.drain_ice_events();

        // Drive DTLS retransmissions; the first flight of an active
        // endpoint also leaves here once ICE has found a path
        if let Some(dtls) = &mut self.dtls
            && let Err(e) = dtls.handshake()
        {
            log::warn!("DTLS handshake failed: {e:?}");
        }

        self.flush_dtls();
        self.evaluate_state();
    }

    fn drain_ice_events(&mut self) {
        while let Some(event) = self.ice.pop_event() {
            match event {
                ice::IceEvent::GatheringStateChanged { old, new } => self
                    .events
                    .push_back(TransportEvent::IceGatheringState { old, new }),
                ice::IceEvent::ConnectionStateChanged { old, new } => self
                    .events
                    .push_back(TransportEvent::IceConnectionState { old, new }),
                ice::IceEvent::DiscoveredAddr { .. } => {}
                ice::IceEvent::SendData {
                    component: _,
                    data,
                    source,
                    target,
                } => self.events.push_back(TransportEvent::SendData {
                    data,
                    source,
                    target,
                }),
            }
        }
    }

    pub(crate) fn pop_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    fn send_path(&self) -> Option<(Option<IpAddr>, SocketAddr)> {
        let (local, remote) = self.ice.discovered_addr(Component::Rtp)?;
        Some((Some(local.ip()), remote))
    }

    /// Move pending DTLS records into send events, once ICE knows where to
    /// send them
    fn flush_dtls(&mut self) {
        let Some((local, remote)) = self.send_path() else {
            return;
        };

        let Some(dtls) = &mut self.dtls else {
            return;
        };

        while let Some(data) = dtls.pop_to_send() {
            self.events.push_back(TransportEvent::SendData {
                data,
                source: local,
                target: remote,
            });
        }
    }

    fn evaluate_state(&mut self) {
        if self.ice.connection_state() == IceConnectionState::Failed {
            self.set_state(TransportConnectionState::Failed);
            return;
        }

        let new = match self.dtls.as_ref().map(|d| d.state()) {
            None => return,
            Some(DtlsState::Handshaking) => TransportConnectionState::Connecting,
            Some(DtlsState::Connected { .. }) => TransportConnectionState::Connected,
            Some(DtlsState::Closed) => TransportConnectionState::Closed,
            Some(DtlsState::Failed) => TransportConnectionState::Failed,
        };

        self.set_state(new);
    }

    fn set_state(&mut self, new: TransportConnectionState) {
        if self.state != new {
            self.events.push_back(TransportEvent::ConnectionState {
                old: self.state,
                new,
            });

            self.state = new;
        }
    }
}
