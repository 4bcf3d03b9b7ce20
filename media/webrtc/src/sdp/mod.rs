//! SDP building & reconciliation
//!
//! Pure helpers translating between the transceiver set and SDP media
//! descriptions: direction arithmetic, codec & header-extension & feedback
//! intersection, and the attribute plumbing which the `sdp-types` model
//! keeps as unknown attributes (`a=rtcp-fb`, `a=msid`, `a=ssrc-group`,
//! `a=sctp-port`).

use crate::rtp::RtpExtensionIds;
use bytesstr::BytesStr;
use sdp_types::{Direction, ExtMap, MediaDescription, MediaType, UnknownAttribute};

mod codecs;
pub(crate) mod negotiate;

pub use codecs::{Codec, Codecs, Feedback, NegotiatedCodec};
pub use sdp_types::{ParseSessionDescriptionError, SessionDescription};

pub(crate) const RTP_MID_HDREXT: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
pub(crate) const RTP_RID_HDREXT: &str = "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id";

pub(crate) const SCTP_PROTO: &str = "UDP/DTLS/SCTP";
pub(crate) const SCTP_PORT: u16 = 5000;

/// Kind of media a transceiver carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub(crate) fn media_type(self) -> MediaType {
        match self {
            MediaKind::Audio => MediaType::Audio,
            MediaKind::Video => MediaType::Video,
        }
    }

    pub(crate) fn from_media_type(media_type: MediaType) -> Option<Self> {
        match media_type {
            MediaType::Audio => Some(MediaKind::Audio),
            MediaType::Video => Some(MediaKind::Video),
            MediaType::Text | MediaType::App => None,
        }
    }
}

/// Send/receive flags of a [`Direction`], more convenient for arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirectionBools {
    pub(crate) send: bool,
    pub(crate) recv: bool,
}

impl From<DirectionBools> for Direction {
    fn from(value: DirectionBools) -> Self {
        match (value.send, value.recv) {
            (true, true) => Direction::SendRecv,
            (true, false) => Direction::SendOnly,
            (false, true) => Direction::RecvOnly,
            (false, false) => Direction::Inactive,
        }
    }
}

impl From<Direction> for DirectionBools {
    fn from(value: Direction) -> Self {
        let (send, recv) = match value {
            Direction::SendRecv => (true, true),
            Direction::SendOnly => (true, false),
            Direction::RecvOnly => (false, true),
            Direction::Inactive => (false, false),
        };

        Self { send, recv }
    }
}

/// Direction to put into an answer m-line, given the direction the remote
/// offered and the local transceiver's intent
///
/// The meet of both sides: we only send if the peer wants to receive and we
/// intend to send, mirrored for receiving.
pub(crate) fn answer_direction(offered: Direction, local: Direction) -> Direction {
    let allowed = DirectionBools::from(offered.flipped());
    let local = DirectionBools::from(local);

    DirectionBools {
        send: local.send && allowed.send,
        recv: local.recv && allowed.recv,
    }
    .into()
}

pub(crate) trait RtpExtensionIdsExt: Sized {
    fn offer() -> Self;
    fn from_sdp(session_desc: &SessionDescription, media_desc: &MediaDescription) -> Self;
    fn to_extmap(&self) -> Vec<ExtMap>;
}

impl RtpExtensionIdsExt for RtpExtensionIds {
    fn offer() -> Self {
        RtpExtensionIds {
            mid: Some(1),
            rid: Some(2),
        }
    }

    fn from_sdp(session_desc: &SessionDescription, media_desc: &MediaDescription) -> Self {
        fn from_extmaps(v: &[ExtMap]) -> RtpExtensionIds {
            RtpExtensionIds {
                mid: v
                    .iter()
                    .find(|extmap| extmap.extension_name == RTP_MID_HDREXT)
                    .map(|extmap| extmap.id),
                rid: v
                    .iter()
                    .find(|extmap| extmap.extension_name == RTP_RID_HDREXT)
                    .map(|extmap| extmap.id),
            }
        }

        let a = from_extmaps(&session_desc.extmap);
        let b = from_extmaps(&media_desc.extmap);

        Self {
            mid: b.mid.or(a.mid),
            rid: b.rid.or(a.rid),
        }
    }

    fn to_extmap(&self) -> Vec<ExtMap> {
        let mut extmap = vec![];

        if let Some(mid_id) = self.mid {
            extmap.push(ExtMap {
                id: mid_id,
                direction: Direction::SendRecv,
                extension_name: BytesStr::from_static(RTP_MID_HDREXT),
                extension_attributes: vec![],
            });
        }

        if let Some(rid_id) = self.rid {
            extmap.push(ExtMap {
                id: rid_id,
                direction: Direction::SendRecv,
                extension_name: BytesStr::from_static(RTP_RID_HDREXT),
                extension_attributes: vec![],
            });
        }

        extmap
    }
}

pub(crate) fn unknown_attr(name: &str, value: String) -> UnknownAttribute {
    UnknownAttribute {
        name: BytesStr::from(name.to_owned()),
        value: Some(BytesStr::from(value)),
    }
}

/// Read all `a=rtcp-fb` values of a media description as `(pt, feedback)`
/// pairs, `pt` being `None` for the `*` wildcard
pub(crate) fn read_feedback(desc: &MediaDescription) -> Vec<(Option<u8>, Feedback)> {
    desc.attributes
        .iter()
        .filter(|attr| attr.name == "rtcp-fb")
        .filter_map(|attr| {
            let value = attr.value.as_ref()?;
            let (pt, kind) = value.split_once(' ')?;

            let pt = if pt == "*" { None } else { Some(pt.parse().ok()?) };

            Some((pt, Feedback::from_sdp_value(kind)?))
        })
        .collect()
}

pub(crate) fn push_feedback(attributes: &mut Vec<UnknownAttribute>, pt: u8, feedback: &[Feedback]) {
    for fb in feedback {
        attributes.push(unknown_attr("rtcp-fb", format!("{pt} {}", fb.as_str())));
    }
}

/// Read the `a=msid` attribute as `(stream_id, track_id)`
pub(crate) fn read_msid(desc: &MediaDescription) -> Option<(String, Option<String>)> {
    let attr = desc.attributes.iter().find(|attr| attr.name == "msid")?;
    let value = attr.value.as_ref()?;

    match value.split_once(' ') {
        Some((stream, track)) => Some((stream.to_owned(), Some(track.to_owned()))),
        None => Some((value.to_string(), None)),
    }
}

pub(crate) fn is_data_media(desc: &MediaDescription) -> bool {
    desc.media.media_type == MediaType::App
        && match &desc.media.proto {
            sdp_types::TransportProtocol::Other(proto) => proto.starts_with(SCTP_PROTO),
            _ => false,
        }
}

pub(crate) fn read_sctp_port(desc: &MediaDescription) -> Option<u16> {
    desc.attributes
        .iter()
        .find(|attr| attr.name == "sctp-port")
        .and_then(|attr| attr.value.as_ref())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_meet_table() {
        use Direction::*;

        // (offered by remote, local intent) -> answer
        let table = [
            (SendOnly, SendRecv, RecvOnly),
            (SendOnly, SendOnly, Inactive),
            (SendOnly, RecvOnly, RecvOnly),
            (SendOnly, Inactive, Inactive),
            (RecvOnly, SendRecv, SendOnly),
            (RecvOnly, SendOnly, SendOnly),
            (RecvOnly, RecvOnly, Inactive),
            (RecvOnly, Inactive, Inactive),
            (SendRecv, SendRecv, SendRecv),
            (SendRecv, SendOnly, SendOnly),
            (SendRecv, RecvOnly, RecvOnly),
            (SendRecv, Inactive, Inactive),
            (Inactive, SendRecv, Inactive),
            (Inactive, SendOnly, Inactive),
            (Inactive, RecvOnly, Inactive),
            (Inactive, Inactive, Inactive),
        ];

        for (offered, local, expected) in table {
            assert_eq!(
                answer_direction(offered, local),
                expected,
                "offered {offered:?} local {local:?}"
            );
        }
    }
}
