use super::{nack::NackGenerator, ntp::NtpTimestamp, report::ReportsQueue, sender::jittered};
use crate::{
    jitter::JitterBuffer,
    opt_min,
    rtp::{RtpPacket, RtpTimestamp, SequenceNumber, Ssrc},
    sdp::{Feedback, NegotiatedCodec},
    transceiver::Track,
};
use bytes::Bytes;
use rtcp_types::{ReportBlock, SenderReport};
use std::time::{Duration, Instant};

/// Minimum interval in which PLI/FIR requests are sent
const RTCP_FEEDBACK_COOLDOWN: Duration = Duration::from_millis(500);

/// Inbound half of a transceiver
///
/// Demultiplexed packets are verified against the negotiated codec, put
/// through a per-encoding jitter buffer, fed to the NACK generator, and
/// accounted for receiver reports. Retransmissions are unwrapped back into
/// the primary stream.
pub struct RtpReceiver {
    track: Track,
    codec: Option<NegotiatedCodec>,

    /// One stream per simulcast encoding; non-simulcast media uses a single
    /// stream with `rid = None`
    streams: Vec<RidStream>,

    jitter_latency: Duration,
    report_interval: Duration,

    want_pli: bool,
    last_pli: Option<Instant>,
    want_fir: bool,
    next_fir_seq: u8,
    last_fir: Option<Instant>,
}

struct RidStream {
    rid: Option<Bytes>,
    ssrc: Option<Ssrc>,

    jitter: JitterBuffer,
    jitter_deadline: Option<Instant>,
    nack: NackGenerator,

    bytes_received: u64,

    /// RFC 3550 interarrival jitter estimate, in RTP timestamp units
    interarrival_jitter: f64,
    last_rtp_received: Option<(Instant, RtpTimestamp)>,

    last_sender_report: Option<NtpTimestamp>,
    remote: Option<RtpReceiverRemoteStats>,

    last_report: Option<(Instant, u64)>,
    next_report_at: Option<Instant>,
}

/// Counters of one received encoding
#[derive(Debug, Clone, Copy)]
pub struct RtpReceiverStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub packets_dropped: u64,
    pub jitter: Duration,
}

/// Remote sender's view, taken from RTCP sender reports
#[derive(Debug, Clone, Copy)]
pub struct RtpReceiverRemoteStats {
    pub timestamp: Instant,
    pub packets_sent: u32,
    pub bytes_sent: u32,
}

/// A packet released by the jitter buffer, ready for the application
pub(crate) struct ReceivedRtp {
    pub(crate) rid: Option<Bytes>,
    pub(crate) packet: RtpPacket,
}

impl RtpReceiver {
    pub(crate) fn new(track: Track, jitter_latency: Duration, report_interval: Duration) -> Self {
        RtpReceiver {
            track,
            codec: None,
            streams: vec![],
            jitter_latency,
            report_interval,
            want_pli: false,
            last_pli: None,
            want_fir: false,
            next_fir_seq: rand::random(),
            last_fir: None,
        }
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    /// Adopt the identifiers the remote announced via `a=msid`
    pub(crate) fn update_track_ids(&mut self, stream_id: String, track_id: Option<String>) {
        self.track.stream_ids = vec![stream_id];

        if let Some(track_id) = track_id {
            self.track.id = track_id;
        }
    }

    pub fn stats(&self) -> Vec<RtpReceiverStats> {
        let clock_rate = self.codec.as_ref().map(|codec| codec.clock_rate);

        self.streams
            .iter()
            .map(|stream| RtpReceiverStats {
                packets_received: stream.jitter.received,
                bytes_received: stream.bytes_received,
                packets_lost: stream.jitter.lost,
                packets_dropped: stream.jitter.dropped,
                jitter: clock_rate
                    .map(|clock_rate| {
                        Duration::from_secs_f64(stream.interarrival_jitter / f64::from(clock_rate))
                    })
                    .unwrap_or_default(),
            })
            .collect()
    }

    pub fn remote_stats(&self) -> Option<RtpReceiverRemoteStats> {
        self.streams.iter().find_map(|stream| stream.remote)
    }

    /// Request a Picture Loss Indication from the remote sender
    pub fn request_pli(&mut self) {
        self.want_pli = true;
    }

    /// Request a Full Intra Request from the remote sender
    pub fn request_fir(&mut self) {
        self.want_fir = true;
    }

    pub(crate) fn set_codec(&mut self, codec: NegotiatedCodec) {
        self.codec = Some(codec);
    }

    pub(crate) fn observed_ssrc(&self) -> Option<Ssrc> {
        self.streams.iter().find_map(|stream| stream.ssrc)
    }

    pub(crate) fn matches_ssrc(&self, ssrc: Ssrc) -> bool {
        self.streams.iter().any(|stream| stream.ssrc == Some(ssrc))
    }

    /// Feed one demultiplexed packet, returning everything the jitter
    /// buffer releases in response
    pub(crate) fn receive(&mut self, now: Instant, packet: RtpPacket) -> Vec<ReceivedRtp> {
        let Some(codec) = self.codec.clone() else {
            log::warn!("Dropping RTP packet received before codec negotiation");
            return vec![];
        };

        let packet = if packet.pt == codec.pt {
            packet
        } else if Some(packet.pt) == codec.rtx_pt {
            // Reassign the retransmission to the primary stream it repairs
            let primary_ssrc = self
                .streams
                .iter()
                .find(|stream| {
                    packet.extensions.rid.is_none() || stream.rid == packet.extensions.rid
                })
                .and_then(|stream| stream.ssrc);

            let Some(primary_ssrc) = primary_ssrc else {
                log::warn!("Got RTX packet before any packet of the primary stream");
                return vec![];
            };

            match unwrap_rtx(packet, codec.pt, primary_ssrc) {
                Some(packet) => packet,
                None => return vec![],
            }
        } else {
            log::warn!(
                "Dropping RTP packet with payload type {} which does not match the negotiated codec (pt={}, rtx={:?})",
                packet.pt,
                codec.pt,
                codec.rtx_pt,
            );
            return vec![];
        };

        let nack_enabled = codec.accepts_feedback(Feedback::Nack);
        let jitter_latency = self.jitter_latency;
        let report_interval = self.report_interval;

        let stream = self.stream_for_packet(&packet, jitter_latency);

        stream.bytes_received += packet.payload.len() as u64;
        stream.update_interarrival_jitter(now, packet.timestamp, codec.clock_rate);

        if nack_enabled {
            stream.nack.record(now, packet.sequence_number);
        }

        if stream.next_report_at.is_none() {
            stream.next_report_at = Some(now + jittered(report_interval));
        }

        let rid = stream.rid.clone();
        let poll = stream.jitter.insert(now, packet);

        if let Some(timer) = poll.timer {
            stream.jitter_deadline = Some(now + timer);
        }

        poll.packets
            .into_iter()
            .map(|packet| ReceivedRtp {
                rid: rid.clone(),
                packet,
            })
            .collect()
    }

    /// Release packets whose jitter buffer deadline has passed
    pub(crate) fn poll(&mut self, now: Instant) -> Vec<ReceivedRtp> {
        let mut out = vec![];

        for stream in &mut self.streams {
            let Some(deadline) = stream.jitter_deadline else {
                continue;
            };

            if now < deadline {
                continue;
            }

            let poll = stream.jitter.handle_timeout(now);
            stream.jitter_deadline = poll.timer.map(|timer| now + timer);

            out.extend(poll.packets.into_iter().map(|packet| ReceivedRtp {
                rid: stream.rid.clone(),
                packet,
            }));
        }

        out
    }

    pub(crate) fn handle_sender_report(&mut self, now: Instant, sender_report: &SenderReport) {
        let ssrc = Ssrc(sender_report.ssrc());

        let Some(stream) = self
            .streams
            .iter_mut()
            .find(|stream| stream.ssrc == Some(ssrc))
        else {
            return;
        };

        stream.last_sender_report = Some(NtpTimestamp::from_instant(now));
        stream.remote = Some(RtpReceiverRemoteStats {
            timestamp: now,
            packets_sent: sender_report.packet_count(),
            bytes_sent: sender_report.octet_count(),
        });
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        let mut timeout = None;

        for stream in &self.streams {
            timeout = opt_min(
                timeout,
                stream
                    .jitter_deadline
                    .map(|deadline| deadline.saturating_duration_since(now)),
            );

            timeout = opt_min(timeout, stream.nack.timeout(now));

            timeout = opt_min(
                timeout,
                stream
                    .next_report_at
                    .map(|at| at.saturating_duration_since(now)),
            );
        }

        if self.want_pli {
            timeout = opt_min(timeout, Some(self.feedback_cooldown(self.last_pli, now)));
        }

        if self.want_fir {
            timeout = opt_min(timeout, Some(self.feedback_cooldown(self.last_fir, now)));
        }

        timeout
    }

    fn feedback_cooldown(&self, last: Option<Instant>, now: Instant) -> Duration {
        last.map(|at| (at + RTCP_FEEDBACK_COOLDOWN).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) fn collect_reports(&mut self, now: Instant, reports: &mut ReportsQueue) {
        let report_interval = self.report_interval;

        for stream in &mut self.streams {
            let Some(ssrc) = stream.ssrc else {
                continue;
            };

            if let Some(nack) = stream.nack.poll(now) {
                reports.add_nack(ssrc, nack);
            }

            stream.collect_report_block(now, ssrc, report_interval, reports);
        }

        let keyframe_ssrc = self.streams.iter().find_map(|stream| stream.ssrc);

        if self.want_pli
            && self.last_pli.is_none_or(|at| at + RTCP_FEEDBACK_COOLDOWN <= now)
            && let Some(ssrc) = keyframe_ssrc
        {
            self.want_pli = false;
            self.last_pli = Some(now);
            reports.add_nack_pli(ssrc);
        }

        if self.want_fir
            && self.last_fir.is_none_or(|at| at + RTCP_FEEDBACK_COOLDOWN <= now)
            && let Some(ssrc) = keyframe_ssrc
        {
            self.want_fir = false;
            self.last_fir = Some(now);
            reports.add_ccm_fir(ssrc, self.next_fir_seq);
            self.next_fir_seq = self.next_fir_seq.wrapping_add(1);
        }
    }

    fn stream_for_packet(&mut self, packet: &RtpPacket, jitter_latency: Duration) -> &mut RidStream {
        let rid = packet.extensions.rid.clone();

        let position = self.streams.iter().position(|stream| {
            if rid.is_some() {
                stream.rid == rid
            } else {
                // Without a RID, match on the learned SSRC, falling back to
                // the first (and usually only) stream
                stream.ssrc == Some(packet.ssrc) || stream.ssrc.is_none()
            }
        });

        let position = match position {
            Some(position) => position,
            None => {
                self.streams.push(RidStream::new(rid, jitter_latency));
                self.streams.len() - 1
            }
        };

        let stream = &mut self.streams[position];

        if stream.ssrc.is_none() {
            stream.ssrc = Some(packet.ssrc);
        }

        stream
    }

    /// Seed the SSRC of the primary stream from `a=ssrc` in the remote
    /// description, so packets can be demultiplexed before the first MID
    /// extension arrives
    pub(crate) fn seed_ssrc(&mut self, ssrc: Ssrc) {
        if self.streams.is_empty() {
            let mut stream = RidStream::new(None, self.jitter_latency);
            stream.ssrc = Some(ssrc);
            self.streams.push(stream);
        }
    }
}

impl RidStream {
    fn new(rid: Option<Bytes>, jitter_latency: Duration) -> Self {
        RidStream {
            rid,
            ssrc: None,
            jitter: JitterBuffer::new(jitter_latency),
            jitter_deadline: None,
            nack: NackGenerator::new(),
            bytes_received: 0,
            interarrival_jitter: 0.0,
            last_rtp_received: None,
            last_sender_report: None,
            remote: None,
            last_report: None,
            next_report_at: None,
        }
    }

    fn update_interarrival_jitter(&mut self, now: Instant, timestamp: RtpTimestamp, clock_rate: u32) {
        if let Some((last_instant, last_timestamp)) = self.last_rtp_received {
            // (Rj - Ri) - (Sj - Si), RFC 3550 section 6.4.1
            let arrival = (now - last_instant).as_secs_f64() * f64::from(clock_rate);
            let transit = f64::from(timestamp.0.wrapping_sub(last_timestamp.0));

            let d = (arrival - transit).abs();

            self.interarrival_jitter += (d - self.interarrival_jitter) / 16.0;
        }

        self.last_rtp_received = Some((now, timestamp));
    }

    fn collect_report_block(
        &mut self,
        now: Instant,
        ssrc: Ssrc,
        report_interval: Duration,
        reports: &mut ReportsQueue,
    ) {
        let Some(next_report_at) = self.next_report_at else {
            return;
        };

        if now < next_report_at {
            return;
        }

        let Some(extended_sequence_number) = self.jitter.highest_received() else {
            return;
        };

        let (last_sr, delay) = if let Some(last_sr) = self.last_sender_report {
            let delay = NtpTimestamp::from_instant(now) - last_sr;
            let delay = (delay.as_seconds_f64() * 65536.0) as u32;

            (last_sr.to_fixed_u32(), delay)
        } else {
            (0, 0)
        };

        let last_lost = self.last_report.map(|(_, lost)| lost).unwrap_or(0);
        let lost_since = self.jitter.lost.saturating_sub(last_lost);
        let expected = self.jitter.received + lost_since;

        let fraction_lost = if expected == 0 {
            0.0
        } else {
            lost_since as f32 / expected as f32
        };

        let report_block = ReportBlock::builder(ssrc.0)
            .fraction_lost((fraction_lost * 255.0) as u8)
            .cumulative_lost(self.jitter.lost as u32)
            .extended_sequence_number(extended_sequence_number.0 as u32)
            .interarrival_jitter(self.interarrival_jitter as u32)
            .last_sender_report_timestamp(last_sr)
            .delay_since_last_sender_report_timestamp(delay);

        reports.add_report_block(report_block);

        self.last_report = Some((now, self.jitter.lost));
        self.next_report_at = Some(now + jittered(report_interval));
    }
}

/// Undo the RTX transformation: restore the original sequence number from
/// the first two payload bytes and reassign the primary payload type
fn unwrap_rtx(packet: RtpPacket, pt: u8, primary_ssrc: Ssrc) -> Option<RtpPacket> {
    let [b0, b1, original_payload @ ..] = &packet.payload[..] else {
        log::warn!("Got RTX packet with invalid payload");
        return None;
    };

    Some(RtpPacket {
        pt,
        sequence_number: SequenceNumber(u16::from_be_bytes([*b0, *b1])),
        ssrc: primary_ssrc,
        timestamp: packet.timestamp,
        marker: packet.marker,
        extensions: packet.extensions.clone(),
        payload: packet.payload.slice_ref(original_payload),
    })
}
