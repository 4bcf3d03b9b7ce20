use crate::{
    opt_min,
    rtp::{ExtendedSequenceNumber, SequenceNumber},
};
use rtcp_types::NackBuilder;
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

/// NACKs are batched instead of being sent per detected gap
const NACK_INTERVAL: Duration = Duration::from_millis(100);

/// Give up on a missing packet after this many NACK rounds
const MAX_RETRIES: u8 = 10;

/// Upper bound of tracked gaps
const MAX_MISSING: usize = 512;

/// Tracks gaps in the incoming sequence numbers of one RTP stream and turns
/// them into batched generic NACK feedback
pub(crate) struct NackGenerator {
    last_received: Option<ExtendedSequenceNumber>,
    missing: BTreeMap<u64, MissingSeq>,
}

struct MissingSeq {
    nacked_at: Option<Instant>,
    detected_at: Instant,
    retries: u8,
}

impl NackGenerator {
    pub(crate) fn new() -> Self {
        NackGenerator {
            last_received: None,
            missing: BTreeMap::new(),
        }
    }

    pub(crate) fn record(&mut self, now: Instant, sequence_number: SequenceNumber) {
        let Some(last_received) = self.last_received else {
            self.last_received = Some(ExtendedSequenceNumber(u64::from(sequence_number.0)));
            return;
        };

        let extended = last_received.guess_extended(sequence_number);

        if extended.0 <= last_received.0 {
            // Late arrival of something that was reported missing
            self.missing.remove(&extended.0);
            return;
        }

        for gap in last_received.0 + 1..extended.0 {
            self.missing.insert(
                gap,
                MissingSeq {
                    nacked_at: None,
                    detected_at: now,
                    retries: 0,
                },
            );
        }

        while self.missing.len() > MAX_MISSING {
            self.missing.pop_first();
        }

        self.last_received = Some(extended);
    }

    /// Collect all sequence numbers that are due for a (re-)NACK
    pub(crate) fn poll(&mut self, now: Instant) -> Option<NackBuilder> {
        let mut nack = NackBuilder::default();
        let mut empty = true;

        self.missing.retain(|_, missing| missing.retries < MAX_RETRIES);

        for (&sequence, missing) in self.missing.iter_mut() {
            let reference = missing.nacked_at.unwrap_or(missing.detected_at);

            if reference + NACK_INTERVAL > now && missing.nacked_at.is_some() {
                continue;
            }

            if missing.nacked_at.is_none() && missing.detected_at + NACK_INTERVAL > now {
                // Allow freshly detected gaps a short reordering window
                continue;
            }

            missing.nacked_at = Some(now);
            missing.retries += 1;

            nack = nack.add_rtp_sequence(sequence as u16);
            empty = false;
        }

        if empty { None } else { Some(nack) }
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        let mut timeout = None;

        for missing in self.missing.values() {
            if missing.retries >= MAX_RETRIES {
                continue;
            }

            let reference = missing.nacked_at.unwrap_or(missing.detected_at);

            timeout = opt_min(
                timeout,
                Some((reference + NACK_INTERVAL).saturating_duration_since(now)),
            );
        }

        timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(generator: &mut NackGenerator, now: Instant, seq: u16) {
        generator.record(now, SequenceNumber(seq));
    }

    #[test]
    fn no_nack_without_gap() {
        let mut generator = NackGenerator::new();
        let now = Instant::now();

        record(&mut generator, now, 10);
        record(&mut generator, now, 11);

        assert!(generator.poll(now + NACK_INTERVAL).is_none());
        assert_eq!(generator.timeout(now), None);
    }

    #[test]
    fn nacks_gap_after_interval() {
        let mut generator = NackGenerator::new();
        let now = Instant::now();

        record(&mut generator, now, 10);
        record(&mut generator, now, 13);

        // Not yet, the gap gets a reordering window first
        assert!(generator.poll(now).is_none());

        let nack = generator.poll(now + NACK_INTERVAL);
        assert!(nack.is_some());
    }

    #[test]
    fn late_arrival_clears_gap() {
        let mut generator = NackGenerator::new();
        let now = Instant::now();

        record(&mut generator, now, 10);
        record(&mut generator, now, 12);
        record(&mut generator, now, 11);

        assert!(generator.poll(now + NACK_INTERVAL).is_none());
    }

    #[test]
    fn gives_up_after_max_retries() {
        let mut generator = NackGenerator::new();
        let mut now = Instant::now();

        record(&mut generator, now, 10);
        record(&mut generator, now, 12);

        for _ in 0..MAX_RETRIES {
            now += NACK_INTERVAL;
            assert!(generator.poll(now).is_some());
        }

        now += NACK_INTERVAL;
        assert!(generator.poll(now).is_none());
        assert_eq!(generator.timeout(now), None);
    }
}
