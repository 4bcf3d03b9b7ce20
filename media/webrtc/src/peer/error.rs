use crate::peer::{SdpType, SignalingState};

/// Errors returned at the peer connection API boundary
///
/// Transport failures (ICE, DTLS handshake, fingerprint mismatch) are not
/// part of this; they surface as a `connection_state_change(failed)` event
/// instead of an `Err`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation is not valid in signaling state {state:?}")]
    InvalidState { state: SignalingState },
    #[error("{kind:?} description is not a valid transition from {state:?}")]
    InvalidTransition {
        state: SignalingState,
        kind: SdpType,
    },
    #[error("no transceiver with the given id")]
    InvalidTransceiverId,
    #[error("no sender with the given id")]
    InvalidSenderId,
    #[error("track kind does not match the transceiver kind")]
    InvalidTrackType,
    #[error("direction is not valid for this transceiver")]
    InvalidTransceiverDirection,
    #[error("remote description has not been set")]
    NoRemoteDescription,
    #[error("media section {mline} is missing a mid attribute")]
    MissingMid { mline: usize },
    #[error("mid {mid:?} is used by multiple media sections")]
    DuplicatedMid { mid: String },
    #[error("description is missing a BUNDLE group")]
    MissingBundleGroup,
    #[error("BUNDLE group does not cover all media sections")]
    NonExhaustiveBundleGroup,
    #[error("description contains multiple BUNDLE groups")]
    MultipleBundleGroups,
    #[error("description is missing ice credentials")]
    MissingIceCredentials,
    #[error("description is missing an ice-ufrag attribute")]
    MissingIceUfrag,
    #[error("description is missing an ice-pwd attribute")]
    MissingIcePwd,
    #[error("media sections carry conflicting ice credentials")]
    ConflictingIceCredentials,
    #[error("description is missing a certificate fingerprint")]
    MissingCertFingerprint,
    #[error("media sections carry conflicting certificate fingerprints")]
    ConflictingCertFingerprints,
    #[error("certificate fingerprint uses an unsupported hash function")]
    UnsupportedCertFingerprintHashFunction,
    #[error("offer does not match the last created offer")]
    OfferAltered,
    #[error("answer does not match the last created answer")]
    AnswerAltered,
}
