//! Reorder-and-release buffer for incoming RTP streams
//!
//! [`JitterBuffer`] is a pure state machine, it does not own a timer task.
//! Both [`insert`](JitterBuffer::insert) and
//! [`handle_timeout`](JitterBuffer::handle_timeout) return a [`JitterPoll`]
//! which carries the packets that are ready to be handed to the application
//! and, if a flush is pending, the duration after which the host must call
//! `handle_timeout`.

use crate::rtp::{ExtendedSequenceNumber, RtpPacket};
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

/// Upper bound of buffered packets, guards against a stalled host timer
const MAX_ENTRIES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No packet has been inserted yet
    InitialWait,
    /// A flush is pending, the host owes us a `handle_timeout` call
    TimerSet,
    /// All packets have been flushed, no timer is armed
    TimerNotSet,
}

/// Result of feeding or ticking the buffer
#[derive(Debug, Default)]
pub struct JitterPoll {
    /// Packets released in sequence-number order
    pub packets: Vec<RtpPacket>,
    /// If set, `handle_timeout` must be called after this duration. Replaces
    /// any previously requested timer.
    pub timer: Option<Duration>,
}

pub struct JitterBuffer {
    latency: Duration,
    state: State,

    /// Packets ordered by `rollover_count * 2^16 + sequence_number`
    store: BTreeMap<u64, (Instant, RtpPacket)>,

    /// Highest index observed, reference for the rollover guess
    reference: Option<ExtendedSequenceNumber>,

    /// Index of the last packet handed out
    last_flushed: Option<u64>,

    pub(crate) received: u64,
    pub(crate) dropped: u64,
    pub(crate) lost: u64,
}

impl JitterBuffer {
    pub fn new(latency: Duration) -> Self {
        JitterBuffer {
            latency,
            state: State::InitialWait,
            store: BTreeMap::new(),
            reference: None,
            last_flushed: None,
            received: 0,
            dropped: 0,
            lost: 0,
        }
    }

    /// Highest extended sequence number seen so far
    pub fn highest_received(&self) -> Option<ExtendedSequenceNumber> {
        self.reference
    }

    pub fn insert(&mut self, now: Instant, packet: RtpPacket) -> JitterPoll {
        let index = match self.reference {
            Some(reference) => reference.guess_extended(packet.sequence_number),
            None => ExtendedSequenceNumber(u64::from(packet.sequence_number.0)),
        };

        if self.reference.is_none_or(|reference| index > reference) {
            self.reference = Some(index);
        }

        if self.last_flushed.is_some_and(|flushed| index.0 <= flushed)
            || self.store.contains_key(&index.0)
        {
            self.dropped += 1;
            return JitterPoll::default();
        }

        self.received += 1;
        self.store.insert(index.0, (now, packet));

        if self.store.len() > MAX_ENTRIES {
            let oldest = *self.store.keys().next().expect("store is not empty");
            self.store.remove(&oldest);
            self.dropped += 1;
        }

        match self.state {
            State::InitialWait => {
                self.state = State::TimerSet;

                JitterPoll {
                    packets: vec![],
                    timer: Some(self.latency),
                }
            }
            State::TimerSet => JitterPoll::default(),
            State::TimerNotSet => self.flush(now),
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) -> JitterPoll {
        self.flush(now)
    }

    /// Release every packet that is either older than the configured latency
    /// (accepting the loss of anything missing before it) or directly
    /// continues the last released sequence number
    fn flush(&mut self, now: Instant) -> JitterPoll {
        let mut packets = vec![];

        loop {
            let Some((&index, &(received_at, _))) = self.store.first_key_value() else {
                break;
            };

            let contiguous = self.last_flushed == Some(index.wrapping_sub(1));
            let expired = received_at + self.latency <= now;

            if !(contiguous || expired) {
                break;
            }

            if let Some(last_flushed) = self.last_flushed {
                self.lost += index - last_flushed - 1;
            }

            let (_, packet) = self.store.remove(&index).expect("key was just looked up");
            self.last_flushed = Some(index);
            packets.push(packet);
        }

        let timer = self
            .store
            .values()
            .next()
            .map(|(received_at, _)| (*received_at + self.latency).saturating_duration_since(now));

        self.state = if timer.is_some() {
            State::TimerSet
        } else {
            State::TimerNotSet
        };

        JitterPoll { packets, timer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{RtpExtensions, RtpTimestamp, SequenceNumber, Ssrc};
    use bytes::Bytes;

    const LATENCY: Duration = Duration::from_millis(200);

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket {
            pt: 96,
            sequence_number: SequenceNumber(seq),
            ssrc: Ssrc(1),
            timestamp: RtpTimestamp(u32::from(seq) * 160),
            marker: false,
            extensions: RtpExtensions::default(),
            payload: Bytes::new(),
        }
    }

    fn seqs(poll: &JitterPoll) -> Vec<u16> {
        poll.packets.iter().map(|p| p.sequence_number.0).collect()
    }

    #[test]
    fn reorders_within_latency() {
        let mut jb = JitterBuffer::new(LATENCY);
        let now = Instant::now();

        let first = jb.insert(now, packet(100));
        assert_eq!(first.timer, Some(LATENCY));

        assert!(jb.insert(now, packet(102)).packets.is_empty());
        assert!(jb.insert(now, packet(101)).packets.is_empty());
        assert!(jb.insert(now, packet(103)).packets.is_empty());

        let poll = jb.handle_timeout(now + LATENCY);
        assert_eq!(seqs(&poll), [100, 101, 102, 103]);
        assert_eq!(poll.timer, None);
        assert_eq!(jb.lost, 0);
        assert_eq!(jb.dropped, 0);
    }

    #[test]
    fn contiguous_packets_flush_eagerly_after_first_timeout() {
        let mut jb = JitterBuffer::new(LATENCY);
        let now = Instant::now();

        jb.insert(now, packet(10));
        jb.handle_timeout(now + LATENCY);

        let poll = jb.insert(now + LATENCY, packet(11));
        assert_eq!(seqs(&poll), [11]);
        assert_eq!(poll.timer, None);
    }

    #[test]
    fn gap_is_skipped_once_expired() {
        let mut jb = JitterBuffer::new(LATENCY);
        let now = Instant::now();

        jb.insert(now, packet(10));
        jb.handle_timeout(now + LATENCY);

        // 11 never arrives
        let poll = jb.insert(now + LATENCY, packet(12));
        assert!(poll.packets.is_empty());
        assert_eq!(poll.timer, Some(LATENCY));

        let poll = jb.handle_timeout(now + LATENCY * 2);
        assert_eq!(seqs(&poll), [12]);
        assert_eq!(jb.lost, 1);
    }

    #[test]
    fn late_packet_is_dropped() {
        let mut jb = JitterBuffer::new(LATENCY);
        let now = Instant::now();

        jb.insert(now, packet(10));
        jb.handle_timeout(now + LATENCY);

        let poll = jb.insert(now + LATENCY, packet(9));
        assert!(poll.packets.is_empty());
        assert_eq!(jb.dropped, 1);
    }

    #[test]
    fn sequence_number_rollover() {
        let mut jb = JitterBuffer::new(LATENCY);
        let now = Instant::now();

        jb.insert(now, packet(65534));
        jb.insert(now, packet(65535));
        jb.insert(now, packet(0));
        jb.insert(now, packet(1));

        let poll = jb.handle_timeout(now + LATENCY);
        assert_eq!(seqs(&poll), [65534, 65535, 0, 1]);
        assert_eq!(jb.lost, 0);
    }
}
