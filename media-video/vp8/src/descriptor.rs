use std::fmt;

const X_BIT: u8 = 0x80;
const N_BIT: u8 = 0x20;
const S_BIT: u8 = 0x10;

const I_BIT: u8 = 0x80;
const L_BIT: u8 = 0x40;
const T_BIT: u8 = 0x20;
const K_BIT: u8 = 0x10;

const M_BIT: u8 = 0x80;

#[derive(Debug, thiserror::Error)]
#[error("VP8 payload descriptor is truncated")]
pub struct ParseVp8DescriptorError;

/// `picture_id` field of the payload descriptor
///
/// The field is either 7 or 15 bits wide on the wire. The width is chosen by
/// the encoder and must be preserved when rewriting the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureId {
    SevenBit(u8),
    FifteenBit(u16),
}

impl PictureId {
    /// Largest representable value, which is also the modulus for wrapping
    /// arithmetic on this field
    pub fn mask(self) -> u16 {
        match self {
            PictureId::SevenBit(..) => 0x7F,
            PictureId::FifteenBit(..) => 0x7FFF,
        }
    }

    pub fn get(self) -> u16 {
        match self {
            PictureId::SevenBit(v) => u16::from(v),
            PictureId::FifteenBit(v) => v,
        }
    }

    /// Returns a picture-id of the same width holding `value` modulo the width
    pub fn with_value(self, value: u16) -> PictureId {
        match self {
            PictureId::SevenBit(..) => PictureId::SevenBit((value & 0x7F) as u8),
            PictureId::FifteenBit(..) => PictureId::FifteenBit(value & 0x7FFF),
        }
    }
}

impl fmt::Display for PictureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.get().fmt(f)
    }
}

/// Parsed VP8 payload descriptor
///
/// Only the fields relevant for forwarding & rewriting are modeled. The
/// descriptor never changes its length when patched back into a payload,
/// since every optional field keeps its presence and width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vp8PayloadDescriptor {
    pub non_reference: bool,
    pub start_of_partition: bool,
    pub partition_index: u8,
    pub picture_id: Option<PictureId>,
    pub tl0picidx: Option<u8>,
    pub tid: Option<u8>,
    pub layer_sync: bool,
    pub keyidx: Option<u8>,

    /// Total length of the descriptor in bytes
    pub header_len: usize,
}

impl Vp8PayloadDescriptor {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseVp8DescriptorError> {
        let mut r = Reader { payload, pos: 0 };

        let b0 = r.next()?;

        let mut desc = Vp8PayloadDescriptor {
            non_reference: b0 & N_BIT != 0,
            start_of_partition: b0 & S_BIT != 0,
            partition_index: b0 & 0x07,
            picture_id: None,
            tl0picidx: None,
            tid: None,
            layer_sync: false,
            keyidx: None,
            header_len: 0,
        };

        if b0 & X_BIT != 0 {
            let ext = r.next()?;

            if ext & I_BIT != 0 {
                let p0 = r.next()?;

                desc.picture_id = Some(if p0 & M_BIT != 0 {
                    let p1 = r.next()?;
                    PictureId::FifteenBit(u16::from(p0 & 0x7F) << 8 | u16::from(p1))
                } else {
                    PictureId::SevenBit(p0 & 0x7F)
                });
            }

            if ext & L_BIT != 0 {
                desc.tl0picidx = Some(r.next()?);
            }

            if ext & (T_BIT | K_BIT) != 0 {
                let tk = r.next()?;

                if ext & T_BIT != 0 {
                    desc.tid = Some(tk >> 6);
                    desc.layer_sync = tk & 0x20 != 0;
                }

                if ext & K_BIT != 0 {
                    desc.keyidx = Some(tk & 0x1F);
                }
            }
        }

        desc.header_len = r.pos;

        Ok(desc)
    }

    /// Returns if the first partition begins a keyframe
    ///
    /// Only meaningful when `start_of_partition` is set and the partition
    /// index is 0.
    pub fn is_keyframe(&self, payload: &[u8]) -> bool {
        self.start_of_partition
            && self.partition_index == 0
            && payload.get(self.header_len).is_some_and(|b| b & 0x01 == 0)
    }

    /// Write the descriptor's field values back into `payload`
    ///
    /// The payload must contain the exact descriptor layout this was parsed
    /// from, since presence flags and field widths are reused as-is.
    pub fn patch(&self, payload: &mut [u8]) {
        let mut pos = 1;

        payload[0] = (payload[0] & (X_BIT | 0x40)) | self.partition_index & 0x07;

        if self.non_reference {
            payload[0] |= N_BIT;
        }

        if self.start_of_partition {
            payload[0] |= S_BIT;
        }

        if payload[0] & X_BIT == 0 {
            return;
        }

        let ext = payload[pos];
        pos += 1;

        if ext & I_BIT != 0 {
            match self.picture_id.expect("layout was checked by parse") {
                PictureId::SevenBit(v) => {
                    payload[pos] = v & 0x7F;
                    pos += 1;
                }
                PictureId::FifteenBit(v) => {
                    payload[pos] = M_BIT | (v >> 8) as u8;
                    payload[pos + 1] = (v & 0xFF) as u8;
                    pos += 2;
                }
            }
        }

        if ext & L_BIT != 0 {
            payload[pos] = self.tl0picidx.expect("layout was checked by parse");
            pos += 1;
        }

        if ext & (T_BIT | K_BIT) != 0 {
            let mut tk = 0;

            if ext & T_BIT != 0 {
                tk |= self.tid.unwrap_or(0) << 6;

                if self.layer_sync {
                    tk |= 0x20;
                }
            }

            if ext & K_BIT != 0 {
                tk |= self.keyidx.unwrap_or(0) & 0x1F;
            }

            payload[pos] = tk;
        }
    }
}

struct Reader<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn next(&mut self) -> Result<u8, ParseVp8DescriptorError> {
        let b = *self
            .payload
            .get(self.pos)
            .ok_or(ParseVp8DescriptorError)?;
        self.pos += 1;
        Ok(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal() {
        let payload = [0x10, 0x00];
        let desc = Vp8PayloadDescriptor::parse(&payload).unwrap();

        assert!(desc.start_of_partition);
        assert_eq!(desc.picture_id, None);
        assert_eq!(desc.header_len, 1);
        assert!(desc.is_keyframe(&payload));
    }

    #[test]
    fn extended_all_fields() {
        // X + S, I(M=1) L T K
        let payload = [
            0x90,
            I_BIT | L_BIT | T_BIT | K_BIT,
            0x81,
            0x23,
            0x42,
            0b10_1_00011,
            0x00,
        ];

        let desc = Vp8PayloadDescriptor::parse(&payload).unwrap();

        assert_eq!(desc.picture_id, Some(PictureId::FifteenBit(0x0123)));
        assert_eq!(desc.tl0picidx, Some(0x42));
        assert_eq!(desc.tid, Some(2));
        assert!(desc.layer_sync);
        assert_eq!(desc.keyidx, Some(3));
        assert_eq!(desc.header_len, 6);
    }

    #[test]
    fn patch_roundtrip() {
        let mut payload = [0x90, I_BIT | L_BIT | K_BIT, 0x81, 0x23, 0x42, 0x03, 0x00];

        let mut desc = Vp8PayloadDescriptor::parse(&payload).unwrap();
        desc.picture_id = Some(PictureId::FifteenBit(0x7FFF));
        desc.tl0picidx = Some(0);
        desc.keyidx = Some(0x1F);

        desc.patch(&mut payload);

        let reparsed = Vp8PayloadDescriptor::parse(&payload).unwrap();
        assert_eq!(reparsed.picture_id, Some(PictureId::FifteenBit(0x7FFF)));
        assert_eq!(reparsed.tl0picidx, Some(0));
        assert_eq!(reparsed.keyidx, Some(0x1F));
        assert_eq!(reparsed.header_len, desc.header_len);
    }

    #[test]
    fn seven_bit_picture_id_keeps_width() {
        let mut payload = [0x80, I_BIT, 0x05, 0x00];

        let mut desc = Vp8PayloadDescriptor::parse(&payload).unwrap();
        assert_eq!(desc.picture_id, Some(PictureId::SevenBit(5)));

        desc.picture_id = Some(desc.picture_id.unwrap().with_value(130));
        desc.patch(&mut payload);

        let reparsed = Vp8PayloadDescriptor::parse(&payload).unwrap();
        assert_eq!(reparsed.picture_id, Some(PictureId::SevenBit(2)));
    }

    #[test]
    fn truncated() {
        assert!(Vp8PayloadDescriptor::parse(&[]).is_err());
        assert!(Vp8PayloadDescriptor::parse(&[0x90]).is_err());
        assert!(Vp8PayloadDescriptor::parse(&[0x90, I_BIT | M_BIT, 0x81]).is_err());
    }
}
