//! # Data Channel Establishment Protocol
//!
//! Parsing & serialization of the DCEP messages (`DATA_CHANNEL_OPEN` and
//! `DATA_CHANNEL_ACK`) which are exchanged over SCTP with PPID 50 to open
//! WebRTC data channels.
//!
//! [RFC8832](https://www.rfc-editor.org/rfc/rfc8832)

use bytes::{Buf, BufMut};
use std::fmt;

const MSG_TYPE_ACK: u8 = 0x02;
const MSG_TYPE_OPEN: u8 = 0x03;

const CHANNEL_TYPE_RELIABLE: u8 = 0x00;
const CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT: u8 = 0x01;
const CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED: u8 = 0x02;
const FLAG_UNORDERED: u8 = 0x80;

#[derive(Debug, thiserror::Error)]
pub enum ParseDcepError {
    #[error("message is empty or too short")]
    Incomplete,
    #[error("unknown DCEP message type {0}")]
    UnknownMessageType(u8),
    #[error("unknown channel type {0:#04X}")]
    UnknownChannelType(u8),
    #[error("label or protocol is not valid UTF-8")]
    InvalidString(#[from] std::str::Utf8Error),
}

/// Reliability mode requested for a data channel
///
/// The wire encoding folds this and the "unordered" flag into the
/// channel-type octet, with the reliability parameter carried separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// Every message is delivered, retransmitted as often as necessary
    Reliable,
    /// Messages are retransmitted at most `retransmits` times
    MaxRetransmits(u32),
    /// Messages are retransmitted for at most `lifetime_ms` milliseconds
    MaxPacketLifetime(u32),
}

impl Reliability {
    fn parameter(&self) -> u32 {
        match self {
            Reliability::Reliable => 0,
            Reliability::MaxRetransmits(n) => *n,
            Reliability::MaxPacketLifetime(ms) => *ms,
        }
    }
}

/// `DATA_CHANNEL_OPEN` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelOpen {
    pub reliability: Reliability,
    pub ordered: bool,
    pub priority: u16,
    pub label: String,
    pub protocol: String,
}

/// Any DCEP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DcepMessage {
    Open(DataChannelOpen),
    Ack,
}

impl DcepMessage {
    pub fn parse(mut i: &[u8]) -> Result<Self, ParseDcepError> {
        if i.is_empty() {
            return Err(ParseDcepError::Incomplete);
        }

        match i.get_u8() {
            MSG_TYPE_ACK => Ok(DcepMessage::Ack),
            MSG_TYPE_OPEN => {
                if i.remaining() < 11 {
                    return Err(ParseDcepError::Incomplete);
                }

                let channel_type = i.get_u8();
                let priority = i.get_u16();
                let parameter = i.get_u32();

                let ordered = channel_type & FLAG_UNORDERED == 0;

                let reliability = match channel_type & !FLAG_UNORDERED {
                    CHANNEL_TYPE_RELIABLE => Reliability::Reliable,
                    CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT => Reliability::MaxRetransmits(parameter),
                    CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED => Reliability::MaxPacketLifetime(parameter),
                    _ => return Err(ParseDcepError::UnknownChannelType(channel_type)),
                };

                let label_len = usize::from(i.get_u16());
                let protocol_len = usize::from(i.get_u16());

                if i.remaining() < label_len + protocol_len {
                    return Err(ParseDcepError::Incomplete);
                }

                let label = std::str::from_utf8(&i[..label_len])?.to_owned();
                i.advance(label_len);
                let protocol = std::str::from_utf8(&i[..protocol_len])?.to_owned();

                Ok(DcepMessage::Open(DataChannelOpen {
                    reliability,
                    ordered,
                    priority,
                    label,
                    protocol,
                }))
            }
            unknown => Err(ParseDcepError::UnknownMessageType(unknown)),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            DcepMessage::Ack => vec![MSG_TYPE_ACK],
            DcepMessage::Open(open) => {
                let mut out = Vec::with_capacity(12 + open.label.len() + open.protocol.len());

                let mut channel_type = match open.reliability {
                    Reliability::Reliable => CHANNEL_TYPE_RELIABLE,
                    Reliability::MaxRetransmits(..) => CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT,
                    Reliability::MaxPacketLifetime(..) => CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED,
                };

                if !open.ordered {
                    channel_type |= FLAG_UNORDERED;
                }

                out.put_u8(MSG_TYPE_OPEN);
                out.put_u8(channel_type);
                out.put_u16(open.priority);
                out.put_u32(open.reliability.parameter());
                out.put_u16(open.label.len() as u16);
                out.put_u16(open.protocol.len() as u16);
                out.put_slice(open.label.as_bytes());
                out.put_slice(open.protocol.as_bytes());

                out
            }
        }
    }
}

impl fmt::Display for DcepMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DcepMessage::Ack => f.write_str("DATA_CHANNEL_ACK"),
            DcepMessage::Open(open) => {
                write!(f, "DATA_CHANNEL_OPEN label={:?}", open.label)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: DcepMessage) {
        let bytes = msg.to_vec();
        assert_eq!(DcepMessage::parse(&bytes).unwrap(), msg);
    }

    #[test]
    fn ack() {
        roundtrip(DcepMessage::Ack);
        assert_eq!(DcepMessage::Ack.to_vec(), [0x02]);
    }

    #[test]
    fn open_reliable_ordered() {
        let msg = DcepMessage::Open(DataChannelOpen {
            reliability: Reliability::Reliable,
            ordered: true,
            priority: 256,
            label: "chat".into(),
            protocol: String::new(),
        });

        let bytes = msg.to_vec();
        assert_eq!(bytes[0], 0x03);
        assert_eq!(bytes[1], 0x00);
        roundtrip(msg);
    }

    #[test]
    fn open_rexmit_unordered() {
        let msg = DcepMessage::Open(DataChannelOpen {
            reliability: Reliability::MaxRetransmits(7),
            ordered: false,
            priority: 0,
            label: String::new(),
            protocol: "proto".into(),
        });

        let bytes = msg.to_vec();
        assert_eq!(bytes[1], 0x81);
        assert_eq!(&bytes[4..8], 7u32.to_be_bytes());
        roundtrip(msg);
    }

    #[test]
    fn open_timed() {
        roundtrip(DcepMessage::Open(DataChannelOpen {
            reliability: Reliability::MaxPacketLifetime(1500),
            ordered: true,
            priority: 0,
            label: "telemetry".into(),
            protocol: "cbor".into(),
        }));
    }

    #[test]
    fn rejects_truncated_open() {
        let msg = DcepMessage::Open(DataChannelOpen {
            reliability: Reliability::Reliable,
            ordered: true,
            priority: 0,
            label: "chat".into(),
            protocol: String::new(),
        });

        let bytes = msg.to_vec();

        for len in 0..bytes.len() {
            assert!(matches!(
                DcepMessage::parse(&bytes[..len]),
                Err(ParseDcepError::Incomplete)
            ));
        }
    }

    #[test]
    fn rejects_unknown_channel_type() {
        let mut bytes = DcepMessage::Open(DataChannelOpen {
            reliability: Reliability::Reliable,
            ordered: true,
            priority: 0,
            label: String::new(),
            protocol: String::new(),
        })
        .to_vec();

        bytes[1] = 0x7F;

        assert!(matches!(
            DcepMessage::parse(&bytes),
            Err(ParseDcepError::UnknownChannelType(0x7F))
        ));
    }
}
