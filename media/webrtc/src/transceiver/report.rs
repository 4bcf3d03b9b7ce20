use crate::{Mtu, rtp::Ssrc};
use rtcp_types::{
    Bye, CompoundBuilder, Fir, NackBuilder, PayloadFeedback, Pli, ReceiverReport, ReportBlock,
    ReportBlockBuilder, RtcpPacket, RtcpPacketWriter, SenderReport, SenderReportBuilder,
    TransportFeedback,
};
use std::{cmp, collections::VecDeque};

/// Collection of RTCP packets to be sent out
///
/// Senders and receivers deposit their reports and feedback here; the peer
/// connection turns the queue into compound RTCP packets.
pub(crate) struct ReportsQueue {
    sender_reports: VecDeque<SenderReportBuilder>,
    report_blocks: VecDeque<ReportBlockBuilder>,

    nacks: Vec<(Ssrc, NackBuilder)>,
    nack_pli: Vec<Ssrc>,
    ccm_fir: Vec<(Ssrc, u8)>,

    sources_to_bye: Vec<Ssrc>,
}

impl ReportsQueue {
    pub(crate) fn new() -> ReportsQueue {
        ReportsQueue {
            sender_reports: VecDeque::new(),
            report_blocks: VecDeque::new(),
            nacks: Vec::new(),
            nack_pli: Vec::new(),
            ccm_fir: Vec::new(),
            sources_to_bye: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        let Self {
            sender_reports,
            report_blocks,
            nacks,
            nack_pli,
            ccm_fir,
            sources_to_bye,
        } = self;

        sender_reports.is_empty()
            && report_blocks.is_empty()
            && nacks.is_empty()
            && nack_pli.is_empty()
            && ccm_fir.is_empty()
            && sources_to_bye.is_empty()
    }

    pub(crate) fn add_sender_report(&mut self, sr: SenderReportBuilder) {
        self.sender_reports.push_back(sr);
    }

    pub(crate) fn add_report_block(&mut self, rb: ReportBlockBuilder) {
        self.report_blocks.push_back(rb);
    }

    pub(crate) fn add_nack(&mut self, media_ssrc: Ssrc, nack: NackBuilder) {
        self.nacks.push((media_ssrc, nack));
    }

    pub(crate) fn add_nack_pli(&mut self, ssrc: Ssrc) {
        self.nack_pli.push(ssrc);
    }

    pub(crate) fn add_ccm_fir(&mut self, ssrc: Ssrc, seq: u8) {
        self.ccm_fir.push((ssrc, seq));
    }

    pub(crate) fn add_bye(&mut self, ssrc: Ssrc) {
        self.sources_to_bye.push(ssrc);
    }

    /// Assemble the next compound RTCP packet, limited by `mtu`
    ///
    /// Returns `None` when the queue is empty. Feedback that does not fit is
    /// kept for the next call.
    pub(crate) fn make_report(&mut self, fallback_sender_ssrc: Ssrc, mtu: Mtu) -> Option<Vec<u8>> {
        self.make_report_compound(fallback_sender_ssrc, mtu)
            .map(|compound| {
                let mut buf = vec![0u8; compound.calculate_size().unwrap()];
                let len = compound.write_into_unchecked(&mut buf);
                buf.truncate(len);
                buf
            })
    }

    fn make_report_compound(
        &mut self,
        fallback_sender_ssrc: Ssrc,
        mtu: Mtu,
    ) -> Option<CompoundBuilder<'static>> {
        if self.is_empty() {
            return None;
        }

        let mut compound = CompoundBuilder::default();

        let mtu = mtu.for_rtcp_packets();

        // Every compound starts with a SR or RR
        let mtu = if !self.sender_reports.is_empty() {
            mtu.saturating_sub(SenderReport::MIN_PACKET_LEN)
        } else {
            mtu.saturating_sub(ReceiverReport::MIN_PACKET_LEN)
        };

        let (mtu, num_nack) = calculate_num_of_packet_type(
            mtu,
            TransportFeedback::MIN_PACKET_LEN,
            8,
            self.nacks.len(),
            usize::MAX,
        );

        let (mtu, num_pli) = calculate_num_of_packet_type(
            mtu,
            0,
            PayloadFeedback::MIN_PACKET_LEN,
            self.nack_pli.len(),
            usize::MAX,
        );

        let (mtu, num_fir) = calculate_num_of_packet_type(
            mtu,
            PayloadFeedback::MIN_PACKET_LEN,
            8,
            self.ccm_fir.len(),
            usize::from(u16::MAX) / 2 - 2,
        );

        let (mtu, num_bye) = calculate_num_of_packet_type(
            mtu,
            Bye::MIN_PACKET_LEN,
            4,
            self.sources_to_bye.len(),
            usize::from(Bye::MAX_COUNT),
        );

        let (_mtu, num_report_blocks) = calculate_num_of_packet_type(
            mtu,
            0,
            ReportBlock::EXPECTED_SIZE,
            self.report_blocks.len(),
            usize::from(SenderReport::MAX_COUNT),
        );

        if let Some(mut sr) = self.sender_reports.pop_front() {
            for report_block in self.report_blocks.drain(..num_report_blocks) {
                sr = sr.add_report_block(report_block);
            }

            compound = compound.add_packet(sr);
        } else {
            let mut rr = ReceiverReport::builder(fallback_sender_ssrc.0);

            for report_block in self.report_blocks.drain(..num_report_blocks) {
                rr = rr.add_report_block(report_block);
            }

            compound = compound.add_packet(rr);
        }

        // Generic NACK transport feedback
        for (media_ssrc, nack) in self.nacks.drain(0..num_nack) {
            compound = compound.add_packet(
                TransportFeedback::builder_owned(nack)
                    .sender_ssrc(fallback_sender_ssrc.0)
                    .media_ssrc(media_ssrc.0),
            );
        }

        // PLI payload feedback
        for media_ssrc in self.nack_pli.drain(0..num_pli) {
            compound = compound.add_packet(
                PayloadFeedback::builder_owned(Pli::builder())
                    .sender_ssrc(fallback_sender_ssrc.0)
                    .media_ssrc(media_ssrc.0),
            );
        }

        // FIR payload feedback
        if num_fir > 0 {
            let mut fir = Fir::builder();

            for (ssrc, sequence) in self.ccm_fir.drain(0..num_fir) {
                fir = fir.add_ssrc(ssrc.0, sequence);
            }

            compound = compound.add_packet(
                PayloadFeedback::builder_owned(fir)
                    // RFC 5104: the media source of a FIR packet is unused
                    // and set to 0, the sources are listed in the FCI
                    .sender_ssrc(fallback_sender_ssrc.0)
                    .media_ssrc(0),
            );
        }

        if num_bye > 0 {
            let mut bye = Bye::builder();

            for ssrc in self.sources_to_bye.drain(0..num_bye) {
                bye = bye.add_source(ssrc.0);
            }

            compound = compound.add_packet(bye);
        }

        Some(compound)
    }
}

fn calculate_num_of_packet_type(
    mtu: usize,
    base_packet_len: usize,
    len_per_entry: usize,
    num_entries: usize,
    max_entries: usize,
) -> (usize, usize) {
    let num = mtu.saturating_sub(base_packet_len) / len_per_entry;
    let num = cmp::min(num, max_entries);
    let num = cmp::min(num, num_entries);

    let mtu = if num == 0 {
        mtu
    } else {
        mtu.saturating_sub(base_packet_len + num * len_per_entry)
    };

    (mtu, num)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcp_types::{Compound, Packet};

    #[test]
    fn empty_queue_makes_no_report() {
        let mut reports = ReportsQueue::new();
        assert!(reports.make_report(Ssrc(0), Mtu::new(1200)).is_none());
    }

    #[test]
    fn single_sr() {
        let mut reports = ReportsQueue::new();

        reports.add_sender_report(SenderReport::builder(0));

        let report = reports.make_report(Ssrc(0), Mtu::new(1200)).unwrap();
        assert!(report.len() <= 1200);

        let mut compound = Compound::parse(&report).unwrap();

        let Packet::Sr(..) = compound.next().unwrap().unwrap() else {
            panic!()
        };
        assert!(compound.next().is_none());
        assert!(reports.is_empty());
    }

    #[test]
    fn rr_with_pli() {
        let mut reports = ReportsQueue::new();

        reports.add_report_block(ReportBlock::builder(0x1234));
        reports.add_nack_pli(Ssrc(0x1234));

        let report = reports.make_report(Ssrc(99), Mtu::new(1200)).unwrap();
        let mut compound = Compound::parse(&report).unwrap();

        let Packet::Rr(rr) = compound.next().unwrap().unwrap() else {
            panic!()
        };
        assert_eq!(rr.n_reports(), 1);

        let Packet::PayloadFeedback(..) = compound.next().unwrap().unwrap() else {
            panic!()
        };
        assert!(compound.next().is_none());
    }
}
