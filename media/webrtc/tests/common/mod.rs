use bytesstr::BytesStr;
use quill_webrtc::{
    DtlsIdentity,
    peer::{OfferOptions, PeerConnection, PeerConnectionEvent, RtcConfig, SdpType},
    sdp::SessionDescription,
};
use std::time::Instant;

pub(crate) fn make_peer() -> PeerConnection {
    PeerConnection::new(DtlsIdentity::generate().unwrap(), RtcConfig::default())
}

/// Drain all queued events
pub(crate) fn events(peer: &mut PeerConnection) -> Vec<PeerConnectionEvent> {
    std::iter::from_fn(|| peer.pop_event()).collect()
}

/// Serialize and reparse a description, simulating the signaling wire
pub(crate) fn through_the_wire(desc: &SessionDescription) -> SessionDescription {
    SessionDescription::parse(&BytesStr::from(desc.to_string())).unwrap()
}

/// Run one complete offer/answer exchange between two peers
pub(crate) fn negotiate(offerer: &mut PeerConnection, answerer: &mut PeerConnection) {
    let now = Instant::now();

    let offer = offerer.create_offer(OfferOptions::default()).unwrap();
    offerer
        .set_local_description(now, SdpType::Offer, offer.clone())
        .unwrap();

    answerer
        .set_remote_description(now, SdpType::Offer, through_the_wire(&offer))
        .unwrap();

    let answer = answerer.create_answer().unwrap();
    answerer
        .set_local_description(now, SdpType::Answer, answer.clone())
        .unwrap();

    offerer
        .set_remote_description(now, SdpType::Answer, through_the_wire(&answer))
        .unwrap();
}
