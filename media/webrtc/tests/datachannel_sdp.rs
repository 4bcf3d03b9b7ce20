use common::{make_peer, negotiate, through_the_wire};
use quill_webrtc::{
    peer::{OfferOptions, SdpType, SignalingState},
    sctp::{DataChannelOptions, DataChannelState},
    sdp::MediaKind,
};
use sdp_types::{Direction, MediaType};
use std::time::Instant;

mod common;

#[test]
fn offer_contains_application_section() {
    let mut peer = make_peer();

    let channel = peer.create_data_channel(
        Instant::now(),
        "chat",
        DataChannelOptions::default(),
    );

    let offer = peer.create_offer(OfferOptions::default()).unwrap();

    assert_eq!(offer.media_descriptions.len(), 1);

    let media = &offer.media_descriptions[0];
    assert_eq!(media.media.media_type, MediaType::App);
    assert_eq!(media.media.port, 9);
    assert_eq!(media.mid.as_deref(), Some("0"));
    assert!(
        media
            .attributes
            .iter()
            .any(|a| a.name == "sctp-port" && a.value.as_deref() == Some("5000"))
    );

    // The application section is part of the BUNDLE group
    assert_eq!(offer.group[0].mids[0], "0");

    // Serializing produces the full m-line including the format token
    let sdp = offer.to_string();
    assert!(sdp.contains("m=application 9 UDP/DTLS/SCTP webrtc-datachannel"));

    // The channel waits for the SCTP association
    assert_eq!(
        peer.data_channel(channel).unwrap().state(),
        DataChannelState::Connecting
    );
    assert_eq!(peer.data_channel(channel).unwrap().stream_id(), None);
}

#[test]
fn application_section_survives_the_wire() {
    let mut a = make_peer();
    let mut b = make_peer();

    a.create_data_channel(Instant::now(), "chat", DataChannelOptions::default());

    let offer = a.create_offer(OfferOptions::default()).unwrap();
    let parsed = through_the_wire(&offer);

    assert_eq!(parsed.media_descriptions[0].media.media_type, MediaType::App);

    let now = Instant::now();

    a.set_local_description(now, SdpType::Offer, offer).unwrap();
    b.set_remote_description(now, SdpType::Offer, parsed).unwrap();

    let answer = b.create_answer().unwrap();
    assert_eq!(answer.media_descriptions.len(), 1);
    assert_eq!(
        answer.media_descriptions[0].media.media_type,
        MediaType::App
    );
    assert_eq!(answer.media_descriptions[0].mid.as_deref(), Some("0"));

    b.set_local_description(now, SdpType::Answer, answer.clone())
        .unwrap();
    a.set_remote_description(now, SdpType::Answer, through_the_wire(&answer))
        .unwrap();

    assert_eq!(a.signaling_state(), SignalingState::Stable);
    assert_eq!(b.signaling_state(), SignalingState::Stable);
}

#[test]
fn media_and_data_bundle_together() {
    let mut a = make_peer();
    let mut b = make_peer();

    a.add_transceiver(MediaKind::Audio, Direction::SendRecv);
    a.create_data_channel(Instant::now(), "chat", DataChannelOptions::default());

    let offer = a.create_offer(OfferOptions::default()).unwrap();

    assert_eq!(offer.media_descriptions.len(), 2);
    assert_eq!(offer.media_descriptions[0].media.media_type, MediaType::Audio);
    assert_eq!(offer.media_descriptions[1].media.media_type, MediaType::App);
    assert_eq!(offer.group[0].mids.len(), 2);

    negotiate(&mut a, &mut b);

    assert_eq!(a.signaling_state(), SignalingState::Stable);
    assert_eq!(b.transceivers().count(), 1);
}
