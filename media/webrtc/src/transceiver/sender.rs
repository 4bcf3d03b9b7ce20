use super::{ntp::NtpTimestamp, report::ReportsQueue};
use crate::{
    rtp::{ExtendedSequenceNumber, RtpPacket, RtpTimestamp, Ssrc},
    sdp::NegotiatedCodec,
    transceiver::Track,
};
use bytes::{BufMut, Bytes};
use rtcp_types::{ReportBlock, SenderReport};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};
use vp8::Vp8Munger;

/// Number of sent packets retained for answering NACKs with retransmissions
const HISTORY_SIZE: usize = 512;

/// Outbound half of a transceiver
///
/// Stamps outgoing packets with the negotiated payload type, the
/// preallocated SSRC and the MID header extension, retains a history of sent
/// packets to serve retransmission requests, and records sender reports.
pub struct RtpSender {
    ssrc: Ssrc,
    rtx_ssrc: Ssrc,

    track: Option<Track>,
    mid: Option<Bytes>,
    codec: Option<NegotiatedCodec>,

    sequence_number: ExtendedSequenceNumber,
    rtx_sequence_number: ExtendedSequenceNumber,

    /// Ring buffer of recently sent packets, most recent at the back
    history: VecDeque<RtpPacket>,

    stats: RtpSenderStats,

    /// Mapping of wall clock to RTP timestamps of the last sent packet,
    /// used to create sender reports
    last_rtp_sent: Option<(Instant, RtpTimestamp)>,

    report_interval: Duration,
    next_report_at: Option<Instant>,
    last_report_sent: Option<Instant>,

    remote: Option<RtpSenderRemoteStats>,

    /// Rewrites VP8 descriptor fields when forwarding switches between
    /// simulcast encodings
    vp8_munger: Option<Vp8Munger>,
}

/// Counters of an [`RtpSender`]
#[derive(Debug, Default, Clone, Copy)]
pub struct RtpSenderStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub markers_sent: u64,
    pub retransmissions_sent: u64,
    pub nacks_received: u64,
    pub plis_received: u64,
}

/// Remote view of this sender's stream, taken from RTCP report blocks
#[derive(Debug, Clone, Copy)]
pub struct RtpSenderRemoteStats {
    pub timestamp: Instant,
    pub loss: f32,
    pub jitter: Duration,
    pub rtt: Option<Duration>,
}

impl RtpSender {
    pub(crate) fn new(report_interval: Duration) -> Self {
        let ssrc = Ssrc(rand::random());

        let mut rtx_ssrc = Ssrc(rand::random());
        while rtx_ssrc == ssrc {
            rtx_ssrc = Ssrc(rand::random());
        }

        RtpSender {
            ssrc,
            rtx_ssrc,
            track: None,
            mid: None,
            codec: None,
            sequence_number: ExtendedSequenceNumber(u64::from(rand::random::<u16>())),
            rtx_sequence_number: ExtendedSequenceNumber(u64::from(rand::random::<u16>())),
            history: VecDeque::new(),
            stats: RtpSenderStats::default(),
            last_rtp_sent: None,
            report_interval,
            next_report_at: None,
            last_report_sent: None,
            remote: None,
            vp8_munger: None,
        }
    }

    /// Turn on VP8 rewriting for senders that forward one of several
    /// simulcast encodings
    ///
    /// The receiver then sees continuous `picture_id`/`tl0picidx`/`keyidx`
    /// sequences and timestamps across encoding switches.
    pub fn enable_vp8_munging(&mut self) {
        if self.vp8_munger.is_none() {
            self.vp8_munger = Some(Vp8Munger::new());
        }
    }

    /// Signal that the following packets come from a different encoding
    pub fn switch_encoding(&mut self) {
        if let Some(munger) = &mut self.vp8_munger {
            munger.update();
        }
    }

    /// SSRC of the primary stream, stable for the sender's lifetime
    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    /// SSRC of the retransmission stream, stable for the sender's lifetime
    pub fn rtx_ssrc(&self) -> Ssrc {
        self.rtx_ssrc
    }

    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    pub fn stats(&self) -> RtpSenderStats {
        self.stats
    }

    pub fn remote_stats(&self) -> Option<RtpSenderRemoteStats> {
        self.remote
    }

    pub(crate) fn set_track(&mut self, track: Option<Track>) {
        self.track = track;
    }

    pub(crate) fn set_mid(&mut self, mid: Bytes) {
        self.mid = Some(mid);
    }

    pub(crate) fn set_codec(&mut self, codec: NegotiatedCodec) {
        self.codec = Some(codec);
    }

    /// Stamp and account an outgoing packet
    ///
    /// Payload type, sequence number, SSRC and the MID extension are
    /// overwritten, the timestamp and marker of the input are kept.
    pub(crate) fn send(&mut self, now: Instant, mut packet: RtpPacket) -> Option<RtpPacket> {
        let codec = self.codec.as_ref()?;

        packet.pt = codec.pt;
        packet.ssrc = self.ssrc;
        packet.sequence_number = self.sequence_number.increase_one();
        packet.extensions.mid = self.mid.clone();

        if let Some(munger) = &mut self.vp8_munger {
            let mut payload = packet.payload.to_vec();

            if let Some(timestamp) = munger.munge(packet.timestamp.0, &mut payload) {
                packet.timestamp = RtpTimestamp(timestamp);
                packet.payload = Bytes::from(payload);
            }
        }

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += packet.payload.len() as u64;

        if packet.marker {
            self.stats.markers_sent += 1;
        }

        self.last_rtp_sent = Some((now, packet.timestamp));

        if self.next_report_at.is_none() {
            self.next_report_at = Some(now + jittered(self.report_interval));
        }

        self.history.push_back(packet.clone());
        if self.history.len() > HISTORY_SIZE {
            self.history.pop_front();
        }

        Some(packet)
    }

    /// Answer a generic NACK with retransmissions from the history
    ///
    /// Retransmitted packets carry the original sequence number as the first
    /// two payload bytes and use the RTX SSRC and payload type.
    pub(crate) fn handle_nack(
        &mut self,
        sequences: impl IntoIterator<Item = u16>,
    ) -> Vec<RtpPacket> {
        debug_assert!(self.stats.packets_sent > 0, "NACK before anything was sent");

        self.stats.nacks_received += 1;

        let Some(rtx_pt) = self.codec.as_ref().and_then(|c| c.rtx_pt) else {
            log::debug!("Ignoring NACK, no RTX stream was negotiated");
            return vec![];
        };

        let mut out = vec![];

        for sequence in sequences {
            let Some(original) = self
                .history
                .iter()
                .find(|p| p.sequence_number.0 == sequence)
            else {
                log::debug!("NACK for sequence number {sequence} not in history");
                continue;
            };

            let mut payload = Vec::with_capacity(original.payload.len() + 2);
            payload.put_u16(original.sequence_number.0);
            payload.put_slice(&original.payload);

            let rtx_packet = RtpPacket {
                pt: rtx_pt,
                sequence_number: self.rtx_sequence_number.increase_one(),
                ssrc: self.rtx_ssrc,
                timestamp: original.timestamp,
                marker: original.marker,
                extensions: original.extensions.clone(),
                payload: Bytes::from(payload),
            };

            self.stats.retransmissions_sent += 1;
            self.stats.bytes_sent += rtx_packet.payload.len() as u64;

            out.push(rtx_packet);
        }

        out
    }

    pub(crate) fn handle_pli(&mut self) {
        self.stats.plis_received += 1;
    }

    pub(crate) fn handle_report_block(&mut self, now: Instant, report_block: ReportBlock) {
        let rtt = if let Some(last_report_sent) = self.last_report_sent {
            let now = NtpTimestamp::from_instant(now);
            let lsr = NtpTimestamp::from_instant(last_report_sent);
            let dlsr = NtpTimestamp::from_fixed_u32(
                report_block.delay_since_last_sender_report_timestamp(),
            );

            (now - lsr - dlsr).to_std_duration()
        } else {
            None
        };

        let jitter = self
            .codec
            .as_ref()
            .map(|codec| {
                Duration::from_secs_f64(
                    f64::from(report_block.interarrival_jitter()) / f64::from(codec.clock_rate),
                )
            })
            .unwrap_or_default();

        self.remote = Some(RtpSenderRemoteStats {
            timestamp: now,
            loss: f32::from(report_block.fraction_lost()) / 255.0,
            jitter,
            rtt,
        });
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        self.next_report_at
            .map(|at| at.saturating_duration_since(now))
    }

    pub(crate) fn collect_reports(&mut self, now: Instant, reports: &mut ReportsQueue) {
        let Some(next_report_at) = self.next_report_at else {
            return;
        };

        if now < next_report_at {
            return;
        }

        let Some(rtp_timestamp) = self.instant_to_rtp_timestamp(now) else {
            return;
        };

        let report = SenderReport::builder(self.ssrc.0)
            .ntp_timestamp(NtpTimestamp::from_instant(now).to_fixed_u64())
            .rtp_timestamp(rtp_timestamp.0)
            .packet_count(self.stats.packets_sent as u32)
            .octet_count(self.stats.bytes_sent as u32);

        reports.add_sender_report(report);

        self.last_report_sent = Some(now);
        self.next_report_at = Some(now + jittered(self.report_interval));
    }

    /// Queue a BYE for this sender's streams, called when the transceiver
    /// is removed by renegotiation
    pub(crate) fn bye(&mut self, reports: &mut ReportsQueue) {
        if self.stats.packets_sent > 0 {
            reports.add_bye(self.ssrc);

            if self.stats.retransmissions_sent > 0 {
                reports.add_bye(self.rtx_ssrc);
            }
        }
    }

    fn instant_to_rtp_timestamp(&self, now: Instant) -> Option<RtpTimestamp> {
        let (sent_at, timestamp) = self.last_rtp_sent?;
        let clock_rate = self.codec.as_ref()?.clock_rate;

        let delta = now.saturating_duration_since(sent_at).as_secs_f64();
        let delta = (delta * f64::from(clock_rate)) as u32;

        Some(RtpTimestamp(timestamp.0.wrapping_add(delta)))
    }
}

/// Report intervals are jittered by ±50% to avoid synchronized RTCP bursts
pub(super) fn jittered(interval: Duration) -> Duration {
    interval.mul_f64(0.5 + rand::random::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{RtpExtensions, SequenceNumber};

    fn sender_with_codec() -> RtpSender {
        let mut sender = RtpSender::new(Duration::from_secs(1));
        sender.set_codec(NegotiatedCodec {
            pt: 96,
            rtx_pt: Some(97),
            name: "VP8".into(),
            clock_rate: 90000,
            channels: None,
            fmtp: None,
            feedback: vec![],
        });
        sender.set_mid(Bytes::from_static(b"0"));
        sender
    }

    fn packet(payload: &'static [u8]) -> RtpPacket {
        RtpPacket {
            pt: 0,
            sequence_number: SequenceNumber(0),
            ssrc: Ssrc(0),
            timestamp: RtpTimestamp(1234),
            marker: true,
            extensions: RtpExtensions::default(),
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn stamps_packets() {
        let mut sender = sender_with_codec();
        let now = Instant::now();

        let sent = sender.send(now, packet(&[3, 2, 5])).unwrap();

        assert_eq!(sent.pt, 96);
        assert_eq!(sent.ssrc, sender.ssrc());
        assert_eq!(sent.extensions.mid.as_deref(), Some(&b"0"[..]));
        assert_eq!(sender.stats().packets_sent, 1);
        assert_eq!(sender.stats().markers_sent, 1);

        let next = sender.send(now, packet(&[1])).unwrap();
        assert_eq!(
            next.sequence_number.0,
            sent.sequence_number.0.wrapping_add(1)
        );
    }

    #[test]
    fn answers_nack_with_rtx() {
        let mut sender = sender_with_codec();
        let now = Instant::now();

        let sent = sender.send(now, packet(&[3, 2, 5])).unwrap();

        let rtx = sender.handle_nack([sent.sequence_number.0]);
        assert_eq!(rtx.len(), 1);

        let rtx = &rtx[0];
        assert_eq!(rtx.pt, 97);
        assert_eq!(rtx.ssrc, sender.rtx_ssrc());
        assert_eq!(&rtx.payload[..2], sent.sequence_number.0.to_be_bytes());
        assert_eq!(&rtx.payload[2..], [3, 2, 5]);
        assert_eq!(sender.stats().retransmissions_sent, 1);
    }

    #[test]
    fn nack_for_unknown_sequence_is_ignored() {
        let mut sender = sender_with_codec();
        sender.send(Instant::now(), packet(&[1]));

        assert!(sender.handle_nack([999]).is_empty());
    }

    #[test]
    fn vp8_munging_keeps_picture_ids_continuous() {
        let mut sender = sender_with_codec();
        sender.enable_vp8_munging();

        let now = Instant::now();

        // X + I, 15-bit picture id
        let vp8_payload = |picture_id: u16| {
            Bytes::from(vec![
                0x90,
                0x80,
                0x80 | (picture_id >> 8) as u8,
                (picture_id & 0xFF) as u8,
                0x00,
            ])
        };

        let mut p = packet(&[]);
        p.payload = vp8_payload(50);
        sender.send(now, p);

        sender.switch_encoding();

        let mut p = packet(&[]);
        p.payload = vp8_payload(800);
        let sent = sender.send(now, p).unwrap();

        let desc = ::vp8::Vp8PayloadDescriptor::parse(&sent.payload).unwrap();
        assert_eq!(desc.picture_id, Some(::vp8::PictureId::FifteenBit(51)));
    }
}
