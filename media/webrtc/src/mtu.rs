const RTP_OVERHEAD: usize = rtp_types::RtpPacket::MIN_RTP_PACKET_LEN;

const SRTP_OVERHEAD: usize = 32;
const SRTCP_OVERHEAD: usize = 32;

/// Maximum Transmission Unit. Utility type to calculate maximum packet sizes.
#[derive(Debug, Clone, Copy)]
pub struct Mtu {
    base: usize,
    rtp_extensions: usize,
}

impl Default for Mtu {
    fn default() -> Self {
        Mtu {
            base: 1472,
            rtp_extensions: 0,
        }
    }
}

impl Mtu {
    /// Create a new MTU config with the given upper limit.
    ///
    /// The limit will always be at least 256. Overhead of the IP & UDP layer
    /// is not taken into account when calculating RTP/RTCP packet sizes.
    pub const fn new(mut mtu: usize) -> Self {
        if mtu < 256 {
            mtu = 256;
        }

        Self {
            base: mtu,
            rtp_extensions: 0,
        }
    }

    pub(crate) const fn with_additional_rtp_extension(mut self, attribute_len: usize) -> Self {
        // Assumes the worst case, that two byte header extensions are used

        if self.rtp_extensions == 0 {
            self.rtp_extensions = 2;
        }

        Self {
            rtp_extensions: self.rtp_extensions + attribute_len + 2,
            ..self
        }
    }

    /// The maximum allowed size of RTP payloads
    pub const fn for_rtp_payload(self) -> usize {
        self.base
            .saturating_sub(SRTP_OVERHEAD)
            .saturating_sub(self.rtp_extensions)
            .saturating_sub(RTP_OVERHEAD)
    }

    pub(crate) const fn for_rtcp_packets(self) -> usize {
        self.base - SRTCP_OVERHEAD
    }

    pub(crate) const fn for_dtls(self) -> usize {
        self.base
    }
}
