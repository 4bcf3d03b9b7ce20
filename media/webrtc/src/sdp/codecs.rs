use std::borrow::Cow;

/// RTCP feedback mechanisms this endpoint can negotiate
///
/// Serialized as `a=rtcp-fb` values; anything else offered by a peer is
/// discarded during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// Generic negative acknowledgement, drives RTX retransmissions
    Nack,
    /// Picture Loss Indication
    NackPli,
    /// Full Intra Request
    CcmFir,
}

impl Feedback {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Feedback::Nack => "nack",
            Feedback::NackPli => "nack pli",
            Feedback::CcmFir => "ccm fir",
        }
    }

    pub(crate) fn from_sdp_value(value: &str) -> Option<Self> {
        match value.trim() {
            "nack" => Some(Feedback::Nack),
            "nack pli" | "pli" => Some(Feedback::NackPli),
            "ccm fir" | "fir" => Some(Feedback::CcmFir),
            _ => None,
        }
    }
}

/// A codec this endpoint is willing to negotiate
#[derive(Debug, Clone)]
pub struct Codec {
    pub(crate) pt: Option<u8>,
    pub(crate) rtx_pt: Option<u8>,
    pub(crate) name: Cow<'static, str>,
    pub(crate) clock_rate: u32,
    pub(crate) channels: Option<u32>,
    pub(crate) fmtp: Option<String>,
    pub(crate) feedback: Vec<Feedback>,
    pub(crate) allow_rtx: bool,
}

impl Codec {
    pub fn new(name: impl Into<Cow<'static, str>>, clock_rate: u32) -> Self {
        Codec {
            pt: None,
            rtx_pt: None,
            name: name.into(),
            clock_rate,
            channels: None,
            fmtp: None,
            feedback: vec![],
            allow_rtx: false,
        }
    }

    pub fn opus() -> Self {
        Codec::new("opus", 48000)
            .with_channels(2)
            .with_fmtp("minptime=10;useinbandfec=1")
    }

    pub fn vp8() -> Self {
        Codec::new("VP8", 90000)
            .with_feedback([Feedback::Nack, Feedback::NackPli, Feedback::CcmFir])
            .with_rtx()
    }

    pub fn h264() -> Self {
        Codec::new("H264", 90000)
            .with_fmtp("level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f")
            .with_feedback([Feedback::Nack, Feedback::NackPli, Feedback::CcmFir])
            .with_rtx()
    }

    /// Pin the payload type instead of having one assigned from the dynamic
    /// range
    pub fn with_pt(mut self, pt: u8) -> Self {
        self.pt = Some(pt);
        self
    }

    pub fn with_channels(mut self, channels: u32) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_fmtp(mut self, fmtp: impl Into<String>) -> Self {
        self.fmtp = Some(fmtp.into());
        self
    }

    pub fn with_feedback(mut self, feedback: impl IntoIterator<Item = Feedback>) -> Self {
        self.feedback.extend(feedback);
        self
    }

    /// Also negotiate a retransmission (RTX) stream for this codec
    pub fn with_rtx(mut self) -> Self {
        self.allow_rtx = true;
        self
    }
}

/// Collection of codecs for one media kind
#[derive(Debug, Clone, Default)]
pub struct Codecs {
    pub(crate) codecs: Vec<Codec>,
}

impl Codecs {
    pub fn new() -> Self {
        Codecs { codecs: vec![] }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codecs.push(codec);
        self
    }
}

/// Codec parameters of a transceiver after (or proposed for) negotiation
///
/// The payload type numbering always follows the remote description once one
/// has been applied.
#[derive(Debug, Clone)]
pub struct NegotiatedCodec {
    pub pt: u8,
    pub rtx_pt: Option<u8>,
    pub name: Cow<'static, str>,
    pub clock_rate: u32,
    pub channels: Option<u32>,
    pub fmtp: Option<String>,
    pub feedback: Vec<Feedback>,
}

impl NegotiatedCodec {
    pub(crate) fn from_config(codec: &Codec) -> Self {
        NegotiatedCodec {
            pt: codec.pt.expect("pt is assigned when building the config"),
            rtx_pt: codec.rtx_pt,
            name: codec.name.clone(),
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            fmtp: codec.fmtp.clone(),
            feedback: codec.feedback.clone(),
        }
    }

    pub(crate) fn accepts_feedback(&self, feedback: Feedback) -> bool {
        self.feedback.contains(&feedback)
    }
}
