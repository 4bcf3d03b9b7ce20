use bytes::Bytes;
pub use dcep_types::Reliability;

slotmap::new_key_type! {
    /// Opaque reference to a data channel within its peer connection
    pub struct DataChannelId;
}

/// Ready state of a data channel
///
/// There is no intermediate `closing` state; closing a channel moves it to
/// `Closed` right away while the stream teardown happens in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    /// Created, but the DCEP handshake has not finished
    Connecting,
    Open,
    Closed,
}

/// Configuration for a locally created data channel
#[derive(Debug, Clone)]
pub struct DataChannelOptions {
    pub protocol: String,
    pub ordered: bool,
    pub reliability: Reliability,
    pub priority: u16,
}

impl Default for DataChannelOptions {
    fn default() -> Self {
        DataChannelOptions {
            protocol: String::new(),
            ordered: true,
            reliability: Reliability::Reliable,
            priority: 256,
        }
    }
}

/// Payload of a data channel message
///
/// The distinction between string and binary survives the wire through the
/// SCTP payload protocol identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelPayload {
    String(String),
    Binary(Bytes),
}

/// State of one data channel
#[derive(Debug)]
pub struct DataChannel {
    pub(crate) stream_id: Option<u16>,
    pub(crate) label: String,
    pub(crate) protocol: String,
    pub(crate) ordered: bool,
    pub(crate) reliability: Reliability,
    pub(crate) priority: u16,
    pub(crate) state: DataChannelState,
    /// The channel was opened by the remote peer
    pub(crate) inbound: bool,
}

impl DataChannel {
    /// SCTP stream id, assigned once the channel is opened over the
    /// association
    pub fn stream_id(&self) -> Option<u16> {
        self.stream_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn ordered(&self) -> bool {
        self.ordered
    }

    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    pub fn state(&self) -> DataChannelState {
        self.state
    }
}
