use crate::rtp::{RtpExtensionIds, RtpPacket};
use bytesstr::BytesStr;
use std::collections::HashMap;

/// Routing tables from decrypted RTP packets to media sections
///
/// Rebuilt from the local description whenever a negotiation completes.
/// Packets are resolved by the MID header extension first, then by payload
/// type, then by SSRCs learned from earlier packets or `a=ssrc` lines.
pub(crate) struct RtpDemuxer {
    extension_ids: RtpExtensionIds,

    mids: Vec<BytesStr>,
    pt_to_mid: HashMap<u8, BytesStr>,
    ssrc_to_mid: HashMap<u32, BytesStr>,
}

/// One media section's contribution to the routing tables
pub(crate) struct DemuxEntry {
    pub(crate) mid: BytesStr,
    pub(crate) pts: Vec<u8>,
    pub(crate) ssrcs: Vec<u32>,
}

impl RtpDemuxer {
    pub(crate) fn new() -> Self {
        RtpDemuxer {
            extension_ids: RtpExtensionIds::default(),
            mids: Vec::new(),
            pt_to_mid: HashMap::new(),
            ssrc_to_mid: HashMap::new(),
        }
    }

    pub(crate) fn extension_ids(&self) -> RtpExtensionIds {
        self.extension_ids
    }

    /// Install the tables for the negotiated media sections
    ///
    /// Learned SSRC mappings survive as long as their media section does. A
    /// payload type used by multiple sections resolves to none of them (the
    /// MID or SSRC has to disambiguate).
    pub(crate) fn rebuild(
        &mut self,
        extension_ids: RtpExtensionIds,
        entries: impl IntoIterator<Item = DemuxEntry>,
    ) {
        self.extension_ids = extension_ids;

        let mut pt_to_mid = HashMap::new();
        let mut ambiguous_pts = vec![];
        let mut mids = vec![];

        let mut ssrc_to_mid = HashMap::new();

        for entry in entries {
            for pt in entry.pts {
                if pt_to_mid.insert(pt, entry.mid.clone()).is_some() {
                    ambiguous_pts.push(pt);
                }
            }

            for ssrc in entry.ssrcs {
                ssrc_to_mid.insert(ssrc, entry.mid.clone());
            }

            mids.push(entry.mid);
        }

        for pt in ambiguous_pts {
            pt_to_mid.remove(&pt);
        }

        // Keep learned mappings of surviving media sections
        for (ssrc, mid) in self.ssrc_to_mid.drain() {
            if mids.contains(&mid) {
                ssrc_to_mid.entry(ssrc).or_insert(mid);
            }
        }

        self.mids = mids;
        self.pt_to_mid = pt_to_mid;
        self.ssrc_to_mid = ssrc_to_mid;
    }

    /// Find the media section a packet belongs to
    pub(crate) fn resolve(&mut self, packet: &RtpPacket) -> Option<BytesStr> {
        if let Some(mid) = &packet.extensions.mid {
            let mid = self.mids.iter().find(|m| m.as_bytes() == &mid[..])?.clone();

            // Remember the SSRC for packets without the extension
            self.ssrc_to_mid.insert(packet.ssrc.0, mid.clone());

            return Some(mid);
        }

        if let Some(mid) = self.pt_to_mid.get(&packet.pt) {
            let mid = mid.clone();
            self.ssrc_to_mid.insert(packet.ssrc.0, mid.clone());
            return Some(mid);
        }

        self.ssrc_to_mid.get(&packet.ssrc.0).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{RtpExtensions, RtpTimestamp, SequenceNumber, Ssrc};
    use bytes::Bytes;

    fn packet(pt: u8, ssrc: u32, mid: Option<&'static [u8]>) -> RtpPacket {
        RtpPacket {
            pt,
            sequence_number: SequenceNumber(1),
            ssrc: Ssrc(ssrc),
            timestamp: RtpTimestamp(0),
            marker: false,
            extensions: RtpExtensions {
                mid: mid.map(Bytes::from_static),
                rid: None,
            },
            payload: Bytes::new(),
        }
    }

    fn demuxer() -> RtpDemuxer {
        let mut demuxer = RtpDemuxer::new();

        demuxer.rebuild(
            RtpExtensionIds {
                mid: Some(1),
                rid: None,
            },
            [
                DemuxEntry {
                    mid: BytesStr::from_static("0"),
                    pts: vec![111],
                    ssrcs: vec![],
                },
                DemuxEntry {
                    mid: BytesStr::from_static("1"),
                    pts: vec![96, 97],
                    ssrcs: vec![0xAABB],
                },
            ],
        );

        demuxer
    }

    #[test]
    fn resolves_by_mid_extension() {
        let mut demuxer = demuxer();

        let mid = demuxer.resolve(&packet(111, 7, Some(b"1"))).unwrap();
        assert_eq!(mid, "1");

        // The SSRC was learned, the extension is no longer needed
        let mid = demuxer.resolve(&packet(111, 7, None)).unwrap();
        assert_eq!(mid, "1");
    }

    #[test]
    fn resolves_by_payload_type() {
        let mut demuxer = demuxer();

        let mid = demuxer.resolve(&packet(96, 8, None)).unwrap();
        assert_eq!(mid, "1");
    }

    #[test]
    fn resolves_by_sdp_declared_ssrc() {
        let mut demuxer = demuxer();

        // 111 is also mapped, use an unknown pt to force the ssrc path
        let mid = demuxer.resolve(&packet(50, 0xAABB, None)).unwrap();
        assert_eq!(mid, "1");
    }

    #[test]
    fn unknown_packet_resolves_to_none() {
        let mut demuxer = demuxer();

        assert!(demuxer.resolve(&packet(50, 9, None)).is_none());
        assert!(demuxer.resolve(&packet(96, 9, Some(b"7"))).is_none());
    }
}
