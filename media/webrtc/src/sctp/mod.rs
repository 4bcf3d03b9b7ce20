//! SCTP transport & data channels
//!
//! Embeds the userland SCTP implementation from `sctp-proto` and runs the
//! Data Channel Establishment Protocol on top of it. SCTP packets travel as
//! DTLS application data over the bundled transport; this module never
//! touches the network itself.

use crate::transport::dtls::DtlsRole;
use bytes::{Bytes, BytesMut};
use dcep_types::{DataChannelOpen, DcepMessage, Reliability};
use sctp_proto::{
    Association, AssociationHandle, ClientConfig, DatagramEvent, Endpoint, EndpointConfig, Event,
    Payload, PayloadProtocolIdentifier, ReliabilityType, ServerConfig, Stream, StreamEvent,
};
use slotmap::SlotMap;
use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

mod channel;

pub use channel::{
    DataChannel, DataChannelId, DataChannelOptions, DataChannelPayload, DataChannelState,
};

/// Events produced by the SCTP transport for the peer connection
pub(crate) enum SctpEvent {
    /// A SCTP packet that must be sent as DTLS application data
    Transmit(Bytes),
    /// A remotely initiated channel finished its DCEP handshake
    IncomingChannel(DataChannelId),
    ChannelStateChanged(DataChannelId, DataChannelState),
    Data(DataChannelId, DataChannelPayload),
    /// The association was lost, the connection is no longer usable
    Failed,
}

/// The SCTP association and all data channels running over it
///
/// The association is established once DTLS is connected: the DTLS client
/// also initiates SCTP and uses even stream ids for its channels, the
/// server odd ones.
pub(crate) struct SctpTransport {
    endpoint: Endpoint,
    association: Option<(AssociationHandle, Association)>,
    role: Option<DtlsRole>,
    connected: bool,

    channels: SlotMap<DataChannelId, DataChannel>,

    events: VecDeque<SctpEvent>,

    /// Placeholder peer address, the association runs over DTLS and never
    /// sees real sockets
    remote: SocketAddr,
}

impl SctpTransport {
    pub(crate) fn new() -> Self {
        SctpTransport {
            endpoint: Endpoint::new(
                Arc::new(EndpointConfig::default()),
                Some(Arc::new(ServerConfig::default())),
            ),
            association: None,
            role: None,
            connected: false,
            channels: SlotMap::with_key(),
            events: VecDeque::new(),
            remote: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), crate::sdp::SCTP_PORT),
        }
    }

    pub(crate) fn channel(&self, id: DataChannelId) -> Option<&DataChannel> {
        self.channels.get(id)
    }

    /// Has a channel been requested (drives offering the application
    /// m-line)
    pub(crate) fn has_channels(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Adopt the peer's announced `a=sctp-port`
    ///
    /// Only effective before the association is established.
    pub(crate) fn set_remote_port(&mut self, port: u16) {
        if self.association.is_none() {
            self.remote.set_port(port);
        }
    }

    /// Create a locally initiated channel
    ///
    /// Stream id allocation and the DCEP handshake happen once the
    /// association is connected; until then the channel stays `Connecting`.
    pub(crate) fn create_channel(
        &mut self,
        now: Instant,
        label: String,
        options: DataChannelOptions,
    ) -> DataChannelId {
        let id = self.channels.insert(DataChannel {
            stream_id: None,
            label,
            protocol: options.protocol,
            ordered: options.ordered,
            reliability: options.reliability,
            priority: options.priority,
            state: DataChannelState::Connecting,
            inbound: false,
        });

        if self.connected {
            self.open_pending_channels(now);
        }

        id
    }

    /// Start the association once DTLS is connected and the role is known
    pub(crate) fn start(&mut self, now: Instant, role: DtlsRole) {
        if self.role.is_some() {
            return;
        }

        self.role = Some(role);

        if role == DtlsRole::Client {
            match self.endpoint.connect(ClientConfig::default(), self.remote) {
                Ok((handle, association)) => {
                    self.association = Some((handle, association));
                    self.drive(now);
                }
                Err(e) => {
                    log::warn!("Failed to start SCTP association: {e}");
                    self.events.push_back(SctpEvent::Failed);
                }
            }
        }
        // The server side waits for the peer's INIT
    }

    /// Feed one SCTP packet received as DTLS application data
    pub(crate) fn receive(&mut self, now: Instant, data: Vec<u8>) {
        match self
            .endpoint
            .handle(now, self.remote, None, None, BytesMut::from(&data[..]).into())
        {
            Some((handle, DatagramEvent::NewAssociation(association))) => {
                if self.association.is_none() {
                    self.association = Some((handle, association));
                } else {
                    log::warn!("Ignoring unexpected second SCTP association");
                }
            }
            Some((handle, DatagramEvent::AssociationEvent(event))) => {
                if let Some((assoc_handle, association)) = &mut self.association
                    && *assoc_handle == handle
                {
                    association.handle_event(event);
                }
            }
            Some(..) | None => {}
        }

        self.drive(now);
    }

    pub(crate) fn timeout(&mut self, now: Instant) -> Option<Duration> {
        let (_, association) = self.association.as_mut()?;

        let deadline = association.poll_timeout()?;

        Some(deadline.saturating_duration_since(now))
    }

    pub(crate) fn poll(&mut self, now: Instant) {
        if let Some((_, association)) = &mut self.association {
            association.handle_timeout(now);
        }

        self.drive(now);
    }

    pub(crate) fn pop_event(&mut self) -> Option<SctpEvent> {
        self.events.pop_front()
    }

    /// Send a message over an open channel, best effort
    ///
    /// Messages for channels that are not open are dropped, there is no
    /// queueing beyond what the SCTP association buffers internally.
    pub(crate) fn send(&mut self, now: Instant, id: DataChannelId, payload: DataChannelPayload) {
        let Some(channel) = self.channels.get(id) else {
            log::warn!("Dropping message for unknown data channel");
            return;
        };

        if channel.state != DataChannelState::Open {
            log::debug!("Dropping message for data channel in state {:?}", channel.state);
            return;
        }

        let stream_id = channel.stream_id.expect("open channels have a stream id");

        let (data, ppi) = match &payload {
            DataChannelPayload::String(s) if s.is_empty() => {
                (Bytes::from_static(&[0]), PayloadProtocolIdentifier::StringEmpty)
            }
            DataChannelPayload::String(s) => (
                Bytes::copy_from_slice(s.as_bytes()),
                PayloadProtocolIdentifier::String,
            ),
            DataChannelPayload::Binary(b) if b.is_empty() => {
                (Bytes::from_static(&[0]), PayloadProtocolIdentifier::BinaryEmpty)
            }
            DataChannelPayload::Binary(b) => (b.clone(), PayloadProtocolIdentifier::Binary),
        };

        let Some((_, association)) = &mut self.association else {
            log::debug!("Dropping message, SCTP association does not exist");
            return;
        };

        match association.stream(stream_id) {
            Ok(mut stream) => {
                if let Err(e) = stream.write_sctp(&data, ppi) {
                    log::warn!("Failed to write to SCTP stream {stream_id}: {e}");
                }
            }
            Err(e) => log::warn!("Failed to access SCTP stream {stream_id}: {e}"),
        }

        self.drive(now);
    }

    /// Close a channel: mark it closed and tear the stream down
    pub(crate) fn close_channel(&mut self, now: Instant, id: DataChannelId) {
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };

        if channel.state == DataChannelState::Closed {
            return;
        }

        channel.state = DataChannelState::Closed;

        if let (Some(stream_id), Some((_, association))) =
            (channel.stream_id, &mut self.association)
            && let Ok(mut stream) = association.stream(stream_id)
        {
            let _ = stream.finish();
            let _ = stream.stop();
        }

        self.events
            .push_back(SctpEvent::ChannelStateChanged(id, DataChannelState::Closed));

        self.drive(now);
    }

    /// Close all channels, used when the peer connection shuts down
    pub(crate) fn close(&mut self) {
        let ids: Vec<_> = self
            .channels
            .iter()
            .filter(|(_, c)| c.state != DataChannelState::Closed)
            .map(|(id, _)| id)
            .collect();

        for id in ids {
            if let Some(channel) = self.channels.get_mut(id) {
                channel.state = DataChannelState::Closed;
            }

            self.events
                .push_back(SctpEvent::ChannelStateChanged(id, DataChannelState::Closed));
        }
    }

    /// Pump the association: endpoint events, application events, stream
    /// reads and outbound packets
    fn drive(&mut self, now: Instant) {
        let Some((handle, association)) = &mut self.association else {
            return;
        };

        while let Some(endpoint_event) = association.poll_endpoint_event() {
            if let Some(association_event) = self.endpoint.handle_event(*handle, endpoint_event) {
                association.handle_event(association_event);
            }
        }

        let mut readable: Vec<u16> = vec![];
        let mut finished: Vec<u16> = vec![];
        let mut lost = false;
        let mut connected = false;

        while let Some(event) = association.poll() {
            match event {
                Event::Connected => connected = true,
                Event::AssociationLost { reason } => {
                    log::warn!("SCTP association lost: {reason}");
                    lost = true;
                }
                Event::Stream(StreamEvent::Readable { id }) => readable.push(id),
                Event::Stream(StreamEvent::Finished { id }) => finished.push(id),
                Event::Stream(StreamEvent::Stopped { id, .. }) => finished.push(id),
                Event::Stream(..) => {}
                _ => {}
            }
        }

        // Streams opened by the remote become visible through accept
        while let Some(stream) = association.accept_stream() {
            readable.push(stream.stream_identifier());
        }

        if connected {
            self.connected = true;
            self.open_pending_channels(now);
        }

        for stream_id in readable {
            self.read_stream(stream_id);
        }

        for stream_id in finished {
            self.handle_remote_close(stream_id);
        }

        if lost {
            self.events.push_back(SctpEvent::Failed);
            self.association = None;
            return;
        }

        let Some((_, association)) = &mut self.association else {
            return;
        };

        while let Some(transmit) = association.poll_transmit(now) {
            if let Payload::RawEncode(packets) = transmit.payload {
                for packet in packets {
                    self.events.push_back(SctpEvent::Transmit(packet));
                }
            }
        }
    }

    /// Allocate stream ids and run DCEP OPEN for all waiting channels
    fn open_pending_channels(&mut self, now: Instant) {
        let Some(role) = self.role else {
            return;
        };

        let pending: Vec<_> = self
            .channels
            .iter()
            .filter(|(_, c)| !c.inbound && c.stream_id.is_none())
            .map(|(id, _)| id)
            .collect();

        for id in pending {
            let stream_id = self.allocate_stream_id(role);

            let Some((_, association)) = &mut self.association else {
                return;
            };

            let channel = &mut self.channels[id];
            channel.stream_id = Some(stream_id);

            let open = DcepMessage::Open(DataChannelOpen {
                reliability: channel.reliability,
                ordered: channel.ordered,
                priority: channel.priority,
                label: channel.label.clone(),
                protocol: channel.protocol.clone(),
            });

            match association.open_stream(stream_id, PayloadProtocolIdentifier::Unknown) {
                Ok(mut stream) => {
                    configure_stream(&mut stream, channel.ordered, channel.reliability);

                    if let Err(e) = stream.write_sctp(
                        &Bytes::from(open.to_vec()),
                        PayloadProtocolIdentifier::Dcep,
                    ) {
                        log::warn!("Failed to send DCEP OPEN on stream {stream_id}: {e}");
                    }
                }
                Err(e) => log::warn!("Failed to open SCTP stream {stream_id}: {e}"),
            }
        }

        self.drive(now);
    }

    /// Smallest unused stream id with the parity belonging to our DTLS role
    fn allocate_stream_id(&self, role: DtlsRole) -> u16 {
        let base = match role {
            DtlsRole::Client => 0,
            DtlsRole::Server => 1,
        };

        let mut candidate = base;

        while self
            .channels
            .values()
            .any(|c| c.stream_id == Some(candidate))
        {
            candidate += 2;
        }

        candidate
    }

    fn read_stream(&mut self, stream_id: u16) {
        loop {
            let Some((_, association)) = &mut self.association else {
                return;
            };

            let Ok(mut stream) = association.stream(stream_id) else {
                return;
            };

            let chunks = match stream.read() {
                Ok(Some(chunks)) => chunks,
                Ok(None) => return,
                Err(e) => {
                    log::warn!("Failed to read from SCTP stream {stream_id}: {e}");
                    return;
                }
            };

            let mut data = vec![0u8; chunks.len()];

            let ppi = chunks.ppi;

            if let Err(e) = chunks.read(&mut data) {
                log::warn!("Failed to read SCTP chunks on stream {stream_id}: {e}");
                return;
            }

            self.handle_message(stream_id, ppi, data);
        }
    }

    fn handle_message(&mut self, stream_id: u16, ppi: PayloadProtocolIdentifier, data: Vec<u8>) {
        let payload = match ppi {
            PayloadProtocolIdentifier::Dcep => {
                self.handle_dcep(stream_id, &data);
                return;
            }
            PayloadProtocolIdentifier::String => match String::from_utf8(data) {
                Ok(s) => DataChannelPayload::String(s),
                Err(e) => {
                    log::warn!("Dropping non-UTF-8 string message on stream {stream_id}: {e}");
                    return;
                }
            },
            PayloadProtocolIdentifier::StringEmpty => DataChannelPayload::String(String::new()),
            PayloadProtocolIdentifier::Binary => DataChannelPayload::Binary(Bytes::from(data)),
            PayloadProtocolIdentifier::BinaryEmpty => DataChannelPayload::Binary(Bytes::new()),
            other => {
                log::warn!("Dropping message with malformed PPID {other:?} on stream {stream_id}");
                return;
            }
        };

        let Some((id, channel)) = self
            .channels
            .iter()
            .find(|(_, c)| c.stream_id == Some(stream_id))
        else {
            log::warn!("Dropping message on stream {stream_id} which has no data channel");
            return;
        };

        if channel.state != DataChannelState::Open {
            log::debug!("Dropping message on non-open data channel");
            return;
        }

        self.events.push_back(SctpEvent::Data(id, payload));
    }

    fn handle_dcep(&mut self, stream_id: u16, data: &[u8]) {
        let message = match DcepMessage::parse(data) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Failed to parse DCEP message on stream {stream_id}: {e}");
                return;
            }
        };

        match message {
            DcepMessage::Open(open) => self.handle_dcep_open(stream_id, open),
            DcepMessage::Ack => {
                let Some((id, channel)) = self
                    .channels
                    .iter_mut()
                    .find(|(_, c)| c.stream_id == Some(stream_id))
                else {
                    log::warn!("Got DCEP ACK for unknown stream {stream_id}");
                    return;
                };

                if channel.state == DataChannelState::Connecting {
                    channel.state = DataChannelState::Open;
                    self.events
                        .push_back(SctpEvent::ChannelStateChanged(id, DataChannelState::Open));
                }
            }
        }
    }

    fn handle_dcep_open(&mut self, stream_id: u16, open: DataChannelOpen) {
        let Some(role) = self.role else {
            return;
        };

        // The remote must use the opposite parity of ours
        let remote_parity = match role {
            DtlsRole::Client => 1,
            DtlsRole::Server => 0,
        };

        if stream_id % 2 != remote_parity {
            log::warn!("Rejecting DCEP OPEN on stream {stream_id} with our own parity");
            return;
        }

        if self
            .channels
            .values()
            .any(|c| c.stream_id == Some(stream_id))
        {
            log::warn!("Got duplicate DCEP OPEN on stream {stream_id}");
            return;
        }

        let Some((_, association)) = &mut self.association else {
            return;
        };

        match association.stream(stream_id) {
            Ok(mut stream) => {
                configure_stream(&mut stream, open.ordered, open.reliability);

                if let Err(e) = stream.write_sctp(
                    &Bytes::from(DcepMessage::Ack.to_vec()),
                    PayloadProtocolIdentifier::Dcep,
                ) {
                    log::warn!("Failed to send DCEP ACK on stream {stream_id}: {e}");
                    return;
                }
            }
            Err(e) => {
                log::warn!("Failed to access stream {stream_id} for DCEP ACK: {e}");
                return;
            }
        }

        let id = self.channels.insert(DataChannel {
            stream_id: Some(stream_id),
            label: open.label,
            protocol: open.protocol,
            ordered: open.ordered,
            reliability: open.reliability,
            priority: open.priority,
            state: DataChannelState::Open,
            inbound: true,
        });

        self.events.push_back(SctpEvent::IncomingChannel(id));
        self.events
            .push_back(SctpEvent::ChannelStateChanged(id, DataChannelState::Open));
    }

    fn handle_remote_close(&mut self, stream_id: u16) {
        let Some((id, channel)) = self
            .channels
            .iter_mut()
            .find(|(_, c)| c.stream_id == Some(stream_id))
        else {
            return;
        };

        if channel.state != DataChannelState::Closed {
            channel.state = DataChannelState::Closed;
            self.events
                .push_back(SctpEvent::ChannelStateChanged(id, DataChannelState::Closed));
        }
    }
}

fn configure_stream(stream: &mut Stream<'_>, ordered: bool, reliability: Reliability) {
    let (reliability_type, value) = match reliability {
        Reliability::Reliable => (ReliabilityType::Reliable, 0),
        Reliability::MaxRetransmits(n) => (ReliabilityType::Rexmit, n),
        Reliability::MaxPacketLifetime(ms) => (ReliabilityType::Timed, ms),
    };

    if let Err(e) = stream.set_reliability_params(!ordered, reliability_type, value) {
        log::warn!("Failed to configure SCTP stream reliability: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exchange queued SCTP packets between two transports until both go
    /// quiet, collecting every non-transmit event
    fn pump(a: &mut SctpTransport, b: &mut SctpTransport, now: Instant) -> (Vec<SctpEvent>, Vec<SctpEvent>) {
        let mut a_events = vec![];
        let mut b_events = vec![];

        loop {
            let mut progressed = false;

            while let Some(event) = a.pop_event() {
                match event {
                    SctpEvent::Transmit(data) => {
                        b.receive(now, data.to_vec());
                        progressed = true;
                    }
                    other => a_events.push(other),
                }
            }

            while let Some(event) = b.pop_event() {
                match event {
                    SctpEvent::Transmit(data) => {
                        a.receive(now, data.to_vec());
                        progressed = true;
                    }
                    other => b_events.push(other),
                }
            }

            if !progressed {
                break;
            }
        }

        (a_events, b_events)
    }

    fn connected_pair(now: Instant) -> (SctpTransport, SctpTransport) {
        let mut a = SctpTransport::new();
        let mut b = SctpTransport::new();

        a.start(now, DtlsRole::Client);
        b.start(now, DtlsRole::Server);

        pump(&mut a, &mut b, now);

        (a, b)
    }

    #[test]
    fn dcep_opens_a_channel_end_to_end() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);

        let chat = a.create_channel(now, "chat".into(), DataChannelOptions::default());

        let (a_events, b_events) = pump(&mut a, &mut b, now);

        // The locally initiated channel went through OPEN/ACK and uses an
        // even stream id (we are the DTLS client)
        assert_eq!(a.channel(chat).unwrap().state(), DataChannelState::Open);
        assert_eq!(a.channel(chat).unwrap().stream_id(), Some(0));
        assert!(a_events.iter().any(|e| matches!(
            e,
            SctpEvent::ChannelStateChanged(_, DataChannelState::Open)
        )));

        // The remote saw the incoming channel with the same label
        let incoming = b_events
            .iter()
            .find_map(|e| match e {
                SctpEvent::IncomingChannel(id) => Some(*id),
                _ => None,
            })
            .expect("remote should see the incoming channel");

        let channel = b.channel(incoming).unwrap();
        assert_eq!(channel.label(), "chat");
        assert_eq!(channel.state(), DataChannelState::Open);
        assert_eq!(channel.stream_id(), Some(0));
    }

    #[test]
    fn string_and_binary_messages_roundtrip() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);

        let chat = a.create_channel(now, "chat".into(), DataChannelOptions::default());
        pump(&mut a, &mut b, now);

        a.send(now, chat, DataChannelPayload::String("hi".into()));
        a.send(now, chat, DataChannelPayload::String(String::new()));
        a.send(now, chat, DataChannelPayload::Binary(Bytes::from(vec![7u8; 2000])));
        a.send(now, chat, DataChannelPayload::Binary(Bytes::new()));

        let (_, b_events) = pump(&mut a, &mut b, now);

        let received: Vec<_> = b_events
            .iter()
            .filter_map(|e| match e {
                SctpEvent::Data(_, payload) => Some(payload.clone()),
                _ => None,
            })
            .collect();

        assert_eq!(
            received,
            [
                DataChannelPayload::String("hi".into()),
                DataChannelPayload::String(String::new()),
                DataChannelPayload::Binary(Bytes::from(vec![7u8; 2000])),
                DataChannelPayload::Binary(Bytes::new()),
            ]
        );
    }

    #[test]
    fn closing_a_channel_notifies_both_sides() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);

        let chat = a.create_channel(now, "chat".into(), DataChannelOptions::default());
        let (_, b_events) = pump(&mut a, &mut b, now);

        let b_id = b_events
            .iter()
            .find_map(|e| match e {
                SctpEvent::IncomingChannel(id) => Some(*id),
                _ => None,
            })
            .unwrap();

        a.close_channel(now, chat);
        assert_eq!(a.channel(chat).unwrap().state(), DataChannelState::Closed);

        let (_, b_events) = pump(&mut a, &mut b, now);

        let closed = b_events.iter().any(|e| {
            matches!(e, SctpEvent::ChannelStateChanged(id, DataChannelState::Closed) if *id == b_id)
        });
        assert!(closed);
        assert_eq!(b.channel(b_id).unwrap().state(), DataChannelState::Closed);
    }

    #[test]
    fn stream_id_parity() {
        let mut transport = SctpTransport::new();

        assert_eq!(transport.allocate_stream_id(DtlsRole::Client), 0);
        assert_eq!(transport.allocate_stream_id(DtlsRole::Server), 1);

        let now = Instant::now();

        let id = transport.create_channel(now, "a".into(), DataChannelOptions::default());
        transport.channels[id].stream_id = Some(0);

        assert_eq!(transport.allocate_stream_id(DtlsRole::Client), 2);
        assert_eq!(transport.allocate_stream_id(DtlsRole::Server), 1);

        let id = transport.create_channel(now, "b".into(), DataChannelOptions::default());
        transport.channels[id].stream_id = Some(2);

        assert_eq!(transport.allocate_stream_id(DtlsRole::Client), 4);
    }
}
