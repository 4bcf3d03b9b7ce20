use super::{RtpExtensionsWriter, RtpTimestamp, SequenceNumber, Ssrc, parse_extensions};
use bytes::Bytes;
use rtp_types::{RtpPacketBuilder, prelude::RtpPacketWriter};

/// An owned RTP packet
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub pt: u8,
    pub sequence_number: SequenceNumber,
    pub ssrc: Ssrc,
    pub timestamp: RtpTimestamp,
    pub marker: bool,
    pub extensions: RtpExtensions,
    pub payload: Bytes,
}

/// Header extensions understood by this crate
#[derive(Debug, Default, Clone)]
pub struct RtpExtensions {
    /// MID of the media section the packet belongs to
    pub mid: Option<Bytes>,
    /// Simulcast restriction identifier of the packet's encoding
    pub rid: Option<Bytes>,
}

/// ID to attribute type map to use when parsing or serializing RTP packets
///
/// The ids are negotiated per session through `a=extmap`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtpExtensionIds {
    pub mid: Option<u8>,
    pub rid: Option<u8>,
}

impl RtpPacket {
    pub fn write_vec(&self, extension_ids: RtpExtensionIds, vec: &mut Vec<u8>) {
        let builder = RtpPacketBuilder::<_, Vec<u8>>::new()
            .payload_type(self.pt)
            .sequence_number(self.sequence_number.0)
            .ssrc(self.ssrc.0)
            .timestamp(self.timestamp.0)
            .marker_bit(self.marker)
            .payload(&self.payload[..]);

        let builder = self.extensions.write(extension_ids, builder);

        vec.reserve(builder.calculate_size().unwrap());

        let mut writer = RtpPacketWriterVec {
            output: vec,
            padding: None,
        };
        builder.write(&mut writer).unwrap();
    }

    pub fn to_vec(&self, extension_ids: RtpExtensionIds) -> Vec<u8> {
        let mut vec = Vec::with_capacity(1500);
        self.write_vec(extension_ids, &mut vec);
        vec
    }

    pub fn parse(
        extension_ids: RtpExtensionIds,
        bytes: impl Into<Bytes>,
    ) -> Result<Self, rtp_types::RtpParseError> {
        let packet: Bytes = bytes.into();

        let parsed = rtp_types::RtpPacket::parse(&packet[..])?;

        let extensions = if let Some((profile, extension_data)) = parsed.extension() {
            RtpExtensions::from_packet(extension_ids, &packet, profile, extension_data)
        } else {
            RtpExtensions::default()
        };

        Ok(Self {
            pt: parsed.payload_type(),
            sequence_number: SequenceNumber(parsed.sequence_number()),
            ssrc: Ssrc(parsed.ssrc()),
            timestamp: RtpTimestamp(parsed.timestamp()),
            marker: parsed.marker_bit(),
            extensions,
            payload: packet.slice_ref(parsed.payload()),
        })
    }
}

impl RtpExtensions {
    fn from_packet(
        ids: RtpExtensionIds,
        bytes: &Bytes,
        profile: u16,
        extension_data: &[u8],
    ) -> Self {
        let mut this = Self::default();

        for (id, data) in parse_extensions(profile, extension_data) {
            if Some(id) == ids.mid {
                this.mid = Some(bytes.slice_ref(data));
            } else if Some(id) == ids.rid {
                this.rid = Some(bytes.slice_ref(data));
            }
        }

        this
    }

    fn write<'b>(
        &self,
        ids: RtpExtensionIds,
        packet_builder: RtpPacketBuilder<&'b [u8], Vec<u8>>,
    ) -> RtpPacketBuilder<&'b [u8], Vec<u8>> {
        let mid = ids.mid.zip(self.mid.as_ref());
        let rid = ids.rid.zip(self.rid.as_ref());

        if mid.is_none() && rid.is_none() {
            return packet_builder;
        }

        let two_byte = [&mid, &rid]
            .into_iter()
            .flatten()
            .any(|(id, v)| *id > 14 || v.len() > 16 || v.is_empty());

        let mut writer = RtpExtensionsWriter::new(two_byte);

        if let Some((id, mid)) = mid {
            writer = writer.with(id, mid);
        }

        if let Some((id, rid)) = rid {
            writer = writer.with(id, rid);
        }

        let (profile, buf) = writer.finish();

        packet_builder.extension(profile, buf)
    }
}

struct RtpPacketWriterVec<'a> {
    output: &'a mut Vec<u8>,
    padding: Option<u8>,
}

impl<'a> RtpPacketWriter for RtpPacketWriterVec<'a> {
    type Output = ();
    type Payload = &'a [u8];
    type Extension = Vec<u8>;

    fn reserve(&mut self, size: usize) {
        if self.output.len() < size {
            self.output.reserve(size - self.output.len());
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.output.extend_from_slice(data)
    }

    fn push_extension(&mut self, extension_data: &Self::Extension) {
        self.push(extension_data)
    }

    fn push_payload(&mut self, data: &Self::Payload) {
        self.push(data)
    }

    fn padding(&mut self, size: u8) {
        self.padding = Some(size);
    }

    fn finish(&mut self) -> Self::Output {
        if let Some(padding) = self.padding.take() {
            self.output
                .resize(self.output.len() + padding as usize - 1, 0);
            self.output.push(padding);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDS: RtpExtensionIds = RtpExtensionIds {
        mid: Some(1),
        rid: Some(2),
    };

    fn packet() -> RtpPacket {
        RtpPacket {
            pt: 96,
            sequence_number: SequenceNumber(1000),
            ssrc: Ssrc(0xC0FFEE),
            timestamp: RtpTimestamp(160),
            marker: true,
            extensions: RtpExtensions {
                mid: Some(Bytes::from_static(b"0")),
                rid: Some(Bytes::from_static(b"hi")),
            },
            payload: Bytes::from_static(&[3, 2, 5]),
        }
    }

    #[test]
    fn roundtrip_with_extensions() {
        let bytes = packet().to_vec(IDS);
        let parsed = RtpPacket::parse(IDS, bytes).unwrap();

        assert_eq!(parsed.pt, 96);
        assert_eq!(parsed.sequence_number, SequenceNumber(1000));
        assert_eq!(parsed.ssrc, Ssrc(0xC0FFEE));
        assert_eq!(parsed.timestamp, RtpTimestamp(160));
        assert!(parsed.marker);
        assert_eq!(parsed.extensions.mid.as_deref(), Some(&b"0"[..]));
        assert_eq!(parsed.extensions.rid.as_deref(), Some(&b"hi"[..]));
        assert_eq!(&parsed.payload[..], [3, 2, 5]);
    }

    #[test]
    fn unknown_extension_ids_are_ignored() {
        let bytes = packet().to_vec(IDS);

        let parsed = RtpPacket::parse(
            RtpExtensionIds {
                mid: Some(7),
                rid: None,
            },
            bytes,
        )
        .unwrap();

        assert_eq!(parsed.extensions.mid, None);
        assert_eq!(parsed.extensions.rid, None);
    }
}
