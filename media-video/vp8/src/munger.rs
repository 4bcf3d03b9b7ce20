use crate::{PictureId, Vp8PayloadDescriptor};

/// RTP timestamp gap assumed between frames until one has been measured
/// (one frame at 30 fps with a 90 kHz clock)
const DEFAULT_FRAME_GAP: u32 = 3000;

/// Rewrites VP8 payload descriptors across simulcast encoding switches
///
/// Every simulcast encoding produces its own `picture_id`, `tl0picidx` and
/// `keyidx` sequences as well as its own RTP timestamps. When the sender
/// switches the encoding that is forwarded to a receiver, the receiver must
/// still see a single continuous sequence or it will discard frames.
///
/// [`update`](Self::update) must be called when the forwarded encoding
/// changes. The next packet passed to [`munge`](Self::munge) then continues
/// the previous sequence by one, and all following packets are shifted by the
/// same offsets, modulo each field's width.
pub struct Vp8Munger {
    offsets: Option<Offsets>,
    pending_update: bool,

    last_out: Option<LastOutput>,

    /// Two most recent distinct input timestamps, used to estimate the
    /// inter-frame timestamp gap of the current encoding
    frame_gap: Option<u32>,
    last_in_timestamp: Option<u32>,
}

#[derive(Default, Clone, Copy)]
struct Offsets {
    timestamp: u32,
    picture_id: u16,
    tl0picidx: u8,
    keyidx: u8,
}

#[derive(Clone, Copy)]
struct LastOutput {
    timestamp: u32,
    picture_id: Option<PictureId>,
    tl0picidx: Option<u8>,
    keyidx: Option<u8>,
}

impl Default for Vp8Munger {
    fn default() -> Self {
        Self::new()
    }
}

impl Vp8Munger {
    pub fn new() -> Self {
        Vp8Munger {
            offsets: None,
            pending_update: false,
            last_out: None,
            frame_gap: None,
            last_in_timestamp: None,
        }
    }

    /// Signal that the next packet will come from a different encoding
    pub fn update(&mut self) {
        // Nothing to splice if no packet was forwarded yet
        if self.last_out.is_some() {
            self.pending_update = true;
        }
    }

    /// Rewrite the descriptor fields and RTP timestamp of a VP8 packet
    ///
    /// Returns the rewritten timestamp, or `None` if the payload does not
    /// carry a parsable descriptor (the payload is then left untouched).
    pub fn munge(&mut self, timestamp: u32, payload: &mut [u8]) -> Option<u32> {
        let mut desc = match Vp8PayloadDescriptor::parse(payload) {
            Ok(desc) => desc,
            Err(e) => {
                log::warn!("Failed to parse VP8 payload descriptor, {e}");
                return None;
            }
        };

        self.track_frame_gap(timestamp);

        if self.pending_update {
            self.pending_update = false;
            self.offsets = Some(self.compute_offsets(timestamp, &desc));
        }

        let offsets = self.offsets.get_or_insert_with(Offsets::default);

        let timestamp = timestamp.wrapping_sub(offsets.timestamp);

        if let Some(picture_id) = desc.picture_id {
            let mask = picture_id.mask();
            desc.picture_id =
                Some(picture_id.with_value(picture_id.get().wrapping_sub(offsets.picture_id) & mask));
        }

        if let Some(tl0picidx) = desc.tl0picidx {
            desc.tl0picidx = Some(tl0picidx.wrapping_sub(offsets.tl0picidx));
        }

        if let Some(keyidx) = desc.keyidx {
            desc.keyidx = Some(keyidx.wrapping_sub(offsets.keyidx) & 0x1F);
        }

        desc.patch(payload);

        self.last_out = Some(LastOutput {
            timestamp,
            picture_id: desc.picture_id,
            tl0picidx: desc.tl0picidx,
            keyidx: desc.keyidx,
        });

        Some(timestamp)
    }

    /// Offsets such that the first packet of the new encoding continues the
    /// previous output by +1 (and by one frame gap for the timestamp)
    fn compute_offsets(&self, timestamp: u32, desc: &Vp8PayloadDescriptor) -> Offsets {
        let last = self.last_out.expect("update is a no-op without output");

        let gap = self.frame_gap.unwrap_or(DEFAULT_FRAME_GAP);

        let picture_id = match (desc.picture_id, last.picture_id) {
            (Some(input), Some(last)) => {
                input.get().wrapping_sub(last.get().wrapping_add(1)) & input.mask()
            }
            _ => 0,
        };

        let tl0picidx = match (desc.tl0picidx, last.tl0picidx) {
            (Some(input), Some(last)) => input.wrapping_sub(last.wrapping_add(1)),
            _ => 0,
        };

        let keyidx = match (desc.keyidx, last.keyidx) {
            (Some(input), Some(last)) => input.wrapping_sub(last.wrapping_add(1)) & 0x1F,
            _ => 0,
        };

        Offsets {
            timestamp: timestamp.wrapping_sub(last.timestamp.wrapping_add(gap)),
            picture_id,
            tl0picidx,
            keyidx,
        }
    }

    fn track_frame_gap(&mut self, timestamp: u32) {
        if self.pending_update {
            // The measured gap belongs to the previous encoding, keep it
            self.last_in_timestamp = Some(timestamp);
            return;
        }

        if let Some(last) = self.last_in_timestamp
            && last != timestamp
        {
            self.frame_gap = Some(timestamp.wrapping_sub(last));
        }

        self.last_in_timestamp = Some(timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// X + I set, 15-bit picture id
    fn payload(picture_id: u16) -> Vec<u8> {
        vec![
            0x90,
            0x80,
            0x80 | (picture_id >> 8) as u8,
            (picture_id & 0xFF) as u8,
            0x00,
        ]
    }

    fn picture_id(payload: &[u8]) -> u16 {
        match Vp8PayloadDescriptor::parse(payload).unwrap().picture_id {
            Some(PictureId::FifteenBit(v)) => v,
            other => panic!("unexpected picture id {other:?}"),
        }
    }

    #[test]
    fn passthrough_without_update() {
        let mut munger = Vp8Munger::new();

        for (i, ts) in [(50u16, 90000u32), (51, 93000), (52, 96000)] {
            let mut p = payload(i);
            assert_eq!(munger.munge(ts, &mut p), Some(ts));
            assert_eq!(picture_id(&p), i);
        }
    }

    #[test]
    fn continuity_across_layer_switch() {
        let mut munger = Vp8Munger::new();

        let mut p = payload(50);
        munger.munge(90000, &mut p);

        munger.update();

        // New encoding starts at a wildly different picture id
        for (i, (input_id, ts)) in [(800u16, 500_000u32), (801, 503_000), (802, 506_000)]
            .into_iter()
            .enumerate()
        {
            let mut p = payload(input_id);
            munger.munge(ts, &mut p);
            assert_eq!(picture_id(&p), 51 + i as u16);
        }
    }

    #[test]
    fn timestamp_continues_by_measured_gap() {
        let mut munger = Vp8Munger::new();

        let mut p = payload(10);
        munger.munge(1000, &mut p);
        let mut p = payload(11);
        munger.munge(4600, &mut p);

        munger.update();

        let mut p = payload(900);
        let ts = munger.munge(800_000, &mut p).unwrap();
        assert_eq!(ts, 4600 + 3600);
        assert_eq!(picture_id(&p), 12);
    }

    #[test]
    fn picture_id_wraps_at_field_width() {
        let mut munger = Vp8Munger::new();

        let mut p = payload(0x7FFE);
        munger.munge(0, &mut p);

        munger.update();

        let mut p = payload(123);
        munger.munge(3000, &mut p);
        assert_eq!(picture_id(&p), 0x7FFF);

        let mut p = payload(124);
        munger.munge(6000, &mut p);
        assert_eq!(picture_id(&p), 0);
    }

    #[test]
    fn unparsable_payload_is_untouched() {
        let mut munger = Vp8Munger::new();

        let mut p = vec![0x90];
        assert_eq!(munger.munge(0, &mut p), None);
        assert_eq!(p, [0x90]);
    }
}
