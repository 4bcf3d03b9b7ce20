//! Transceivers: the per-m-line media pipeline
//!
//! A [`Transceiver`] pairs an [`RtpSender`] and an [`RtpReceiver`] and
//! carries everything negotiation attaches to one m-line: the MID, the
//! m-line index, directions and the negotiated codec set.

use crate::{
    rtp::RtpExtensionIds,
    sdp::{MediaKind, NegotiatedCodec},
};
use bytes::Bytes;
use bytesstr::BytesStr;
use sdp_types::Direction;
use std::time::Duration;

mod nack;
mod ntp;
mod receiver;
pub(crate) mod report;
mod sender;
mod track;

pub use receiver::{RtpReceiver, RtpReceiverRemoteStats, RtpReceiverStats};
pub use sender::{RtpSender, RtpSenderRemoteStats, RtpSenderStats};
pub use track::Track;

pub(crate) use receiver::ReceivedRtp;
pub(crate) use report::ReportsQueue;

/// Stable identity of a transceiver within its peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransceiverId(pub(crate) u32);

pub struct Transceiver {
    id: TransceiverId,
    kind: MediaKind,

    /// Media section identifier, assigned at the first negotiation this
    /// transceiver takes part in and immutable afterwards
    mid: Option<BytesStr>,

    /// Index of the m-line this transceiver is associated with. A
    /// transceiver never moves to a different index once associated.
    mline_index: Option<usize>,

    /// The direction the application asked for
    direction: Direction,

    /// The direction of the last completed negotiation
    current_direction: Option<Direction>,

    /// Receive side of `current_direction` the application has been
    /// notified about, drives `track` / `track_muted` events
    fired_direction: Option<Direction>,

    codecs: Vec<NegotiatedCodec>,
    extension_ids: RtpExtensionIds,

    sender: RtpSender,
    receiver: RtpReceiver,

    pub(crate) added_by_add_track: bool,

    /// Stop was requested locally, takes effect with the next negotiation
    stopping: bool,
    stopped: bool,
}

impl Transceiver {
    pub(crate) fn new(
        id: TransceiverId,
        kind: MediaKind,
        direction: Direction,
        codecs: Vec<NegotiatedCodec>,
        extension_ids: RtpExtensionIds,
        jitter_latency: Duration,
        report_interval: Duration,
    ) -> Self {
        Transceiver {
            id,
            kind,
            mid: None,
            mline_index: None,
            direction,
            current_direction: None,
            fired_direction: None,
            codecs,
            extension_ids,
            sender: RtpSender::new(report_interval),
            receiver: RtpReceiver::new(Track::generate(kind), jitter_latency, report_interval),
            added_by_add_track: false,
            stopping: false,
            stopped: false,
        }
    }

    pub fn id(&self) -> TransceiverId {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn mid(&self) -> Option<&str> {
        self.mid.as_deref()
    }

    pub fn mline_index(&self) -> Option<usize> {
        self.mline_index
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn current_direction(&self) -> Option<Direction> {
        self.current_direction
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub(crate) fn stopping(&self) -> bool {
        self.stopping
    }

    pub fn sender(&self) -> &RtpSender {
        &self.sender
    }

    pub fn receiver(&self) -> &RtpReceiver {
        &self.receiver
    }

    pub fn receiver_mut(&mut self) -> &mut RtpReceiver {
        &mut self.receiver
    }

    pub fn sender_mut(&mut self) -> &mut RtpSender {
        &mut self.sender
    }

    /// The codecs currently configured or negotiated, in preference order
    pub fn codecs(&self) -> &[NegotiatedCodec] {
        &self.codecs
    }

    pub(crate) fn extension_ids(&self) -> RtpExtensionIds {
        self.extension_ids
    }

    pub(crate) fn set_extension_ids(&mut self, extension_ids: RtpExtensionIds) {
        self.extension_ids = extension_ids;
    }

    pub(crate) fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub(crate) fn set_current_direction(&mut self, direction: Direction) {
        self.current_direction = Some(direction);
    }

    pub(crate) fn fired_direction(&self) -> Option<Direction> {
        self.fired_direction
    }

    pub(crate) fn set_fired_direction(&mut self, direction: Option<Direction>) {
        self.fired_direction = direction;
    }

    pub(crate) fn set_mid(&mut self, mid: BytesStr) {
        debug_assert!(self.mid.is_none() || self.mid.as_ref() == Some(&mid));

        self.sender
            .set_mid(Bytes::copy_from_slice(mid.as_bytes()));
        self.mid = Some(mid);
    }

    pub(crate) fn associate(&mut self, mline_index: usize) {
        debug_assert!(
            self.mline_index.is_none() || self.mline_index == Some(mline_index),
            "transceivers never move between m-lines"
        );

        self.mline_index = Some(mline_index);
    }

    /// Replace the codec set with the outcome of a negotiation and push the
    /// primary codec down into sender & receiver
    pub(crate) fn set_negotiated_codecs(&mut self, codecs: Vec<NegotiatedCodec>) {
        if let Some(primary) = codecs.first() {
            self.sender.set_codec(primary.clone());
            self.receiver.set_codec(primary.clone());
        }

        self.codecs = codecs;
    }

    /// Request this transceiver to stop sending and receiving
    ///
    /// Takes full effect with the next completed negotiation, which removes
    /// the transceiver from the session.
    pub(crate) fn stop(&mut self) {
        self.stopping = true;
        self.direction = Direction::Inactive;
    }

    pub(crate) fn mark_stopped(&mut self) {
        self.stopping = true;
        self.stopped = true;
        // A stopped transceiver has no negotiated direction
        self.current_direction = None;
    }
}
