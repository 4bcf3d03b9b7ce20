use common::{events, make_peer, negotiate, through_the_wire};
use quill_webrtc::{
    peer::{OfferOptions, PeerConnectionEvent, SdpType, SignalingState},
    sdp::MediaKind,
    transceiver::Track,
};
use sdp_types::{Direction, MediaType, Setup, TransportProtocol};
use std::time::Instant;

mod common;

#[test]
fn offer_shape() {
    let mut peer = make_peer();

    peer.add_transceiver(MediaKind::Audio, Direction::SendRecv);

    let offer = peer.create_offer(OfferOptions::default()).unwrap();

    assert_eq!(offer.media_descriptions.len(), 1);

    let media = &offer.media_descriptions[0];
    assert_eq!(media.media.media_type, MediaType::Audio);
    assert_eq!(media.media.port, 9);
    assert_eq!(media.media.proto, TransportProtocol::UdpTlsRtpSavpf);
    assert_eq!(media.mid.as_deref(), Some("0"));
    assert_eq!(media.direction, Direction::SendRecv);
    assert!(matches!(media.setup, Some(Setup::ActPass)));
    assert!(media.rtcp_mux);
    assert!(media.extmap.iter().any(|e| e.extension_name.contains("sdes:mid")));

    // Session level: credentials, sha-256 fingerprint and one exhaustive
    // BUNDLE group
    assert!(offer.ice_ufrag.is_some());
    assert!(offer.ice_pwd.is_some());
    assert_eq!(offer.fingerprint.len(), 1);
    assert_eq!(offer.group.len(), 1);
    assert_eq!(offer.group[0].typ, "BUNDLE");
    assert_eq!(offer.group[0].mids.len(), 1);
    assert_eq!(offer.group[0].mids[0], "0");
    assert!(offer.extmap_allow_mixed);

    // The offer round-trips through serialization
    let reparsed = through_the_wire(&offer);
    assert_eq!(reparsed.media_descriptions.len(), 1);
    assert_eq!(reparsed.media_descriptions[0].mid.as_deref(), Some("0"));
}

#[test]
fn create_offer_requires_stable_or_have_local_offer() {
    let mut a = make_peer();
    let mut b = make_peer();

    a.add_transceiver(MediaKind::Audio, Direction::SendRecv);

    let offer = a.create_offer(OfferOptions::default()).unwrap();
    b.set_remote_description(Instant::now(), SdpType::Offer, through_the_wire(&offer))
        .unwrap();

    // b has a remote offer and may not create one itself
    assert!(b.create_offer(OfferOptions::default()).is_err());
    // ... but a may re-create its offer
    a.set_local_description(Instant::now(), SdpType::Offer, offer)
        .unwrap();
    assert!(a.create_offer(OfferOptions::default()).is_ok());
}

#[test]
fn audio_exchange_reaches_stable() {
    let mut a = make_peer();
    let mut b = make_peer();

    let id = a.add_track(Track::new(MediaKind::Audio, "mic").with_stream_id("stream"));

    negotiate(&mut a, &mut b);

    assert_eq!(a.signaling_state(), SignalingState::Stable);
    assert_eq!(b.signaling_state(), SignalingState::Stable);

    // b auto-created a recvonly transceiver, so the meet leaves a sending
    // only
    let a_transceiver = a.transceiver(id).unwrap();
    assert_eq!(a_transceiver.current_direction(), Some(Direction::SendOnly));

    let b_transceiver = b.transceivers().next().unwrap();
    assert_eq!(b_transceiver.current_direction(), Some(Direction::RecvOnly));
    assert_eq!(b_transceiver.mid(), a_transceiver.mid());

    // b learned about the incoming track
    let b_events = events(&mut b);
    assert!(
        b_events
            .iter()
            .any(|e| matches!(e, PeerConnectionEvent::Track { track, .. } if track.kind == MediaKind::Audio))
    );
}

#[test]
fn codecs_adopt_remote_numbering() {
    let mut a = make_peer();
    let mut b = make_peer();

    a.add_transceiver(MediaKind::Video, Direction::SendRecv);

    negotiate(&mut a, &mut b);

    let a_codec = &a.transceivers().next().unwrap().codecs()[0];
    let b_codec = &b.transceivers().next().unwrap().codecs()[0];

    assert_eq!(a_codec.pt, b_codec.pt);
    assert_eq!(a_codec.rtx_pt, b_codec.rtx_pt);
    assert!(a_codec.name.eq_ignore_ascii_case("VP8"));
    assert!(a_codec.rtx_pt.is_some());
}

#[test]
fn rejecting_direction_mutes_track() {
    let mut a = make_peer();
    let mut b = make_peer();

    a.add_transceiver(MediaKind::Audio, Direction::SendRecv);

    let now = Instant::now();

    let offer = a.create_offer(OfferOptions::default()).unwrap();
    a.set_local_description(now, SdpType::Offer, offer.clone())
        .unwrap();
    b.set_remote_description(now, SdpType::Offer, through_the_wire(&offer))
        .unwrap();

    // The incoming track fires immediately when the offer is applied
    assert!(
        events(&mut b)
            .iter()
            .any(|e| matches!(e, PeerConnectionEvent::Track { .. }))
    );

    // b shuts the media down before answering
    let b_id = b.transceivers().next().unwrap().id();
    b.set_transceiver_direction(b_id, Direction::Inactive)
        .unwrap();

    let answer = b.create_answer().unwrap();
    assert_eq!(answer.media_descriptions[0].direction, Direction::Inactive);

    b.set_local_description(now, SdpType::Answer, answer.clone())
        .unwrap();
    a.set_remote_description(now, SdpType::Answer, through_the_wire(&answer))
        .unwrap();

    assert_eq!(
        b.transceiver(b_id).unwrap().current_direction(),
        Some(Direction::Inactive)
    );
    assert_eq!(
        a.transceivers().next().unwrap().current_direction(),
        Some(Direction::Inactive)
    );

    assert!(
        events(&mut b)
            .iter()
            .any(|e| matches!(e, PeerConnectionEvent::TrackMuted(..)))
    );
}

#[test]
fn add_track_reuses_recvonly_transceiver() {
    let mut a = make_peer();
    let mut b = make_peer();

    a.add_track(Track::new(MediaKind::Audio, "mic"));

    negotiate(&mut a, &mut b);

    // b's transceiver was created by the remote offer, not by add_track,
    // so adding a track creates a new transceiver
    let first = b.transceivers().next().unwrap().id();
    let second = b.add_track(Track::new(MediaKind::Audio, "echo"));
    assert_ne!(first, second);
    assert_eq!(b.transceivers().count(), 2);

    // a's own transceiver came from add_track; removing and re-adding the
    // track reuses it
    let a_id = a.transceivers().next().unwrap().id();
    a.remove_track(a_id).unwrap();
    assert_eq!(a.transceivers().next().unwrap().direction(), Direction::RecvOnly);

    let reused = a.add_track(Track::new(MediaKind::Audio, "mic2"));
    assert_eq!(reused, a_id);
    assert_eq!(a.transceivers().count(), 1);
    assert_eq!(a.transceivers().next().unwrap().direction(), Direction::SendRecv);
}

#[test]
fn negotiation_needed_fires_once_in_stable() {
    let mut peer = make_peer();

    peer.add_transceiver(MediaKind::Audio, Direction::SendRecv);
    peer.add_transceiver(MediaKind::Video, Direction::SendRecv);

    let needed = events(&mut peer)
        .iter()
        .filter(|e| matches!(e, PeerConnectionEvent::NegotiationNeeded))
        .count();

    assert_eq!(needed, 1);
}

#[test]
fn altered_offer_is_rejected() {
    let mut peer = make_peer();

    peer.add_transceiver(MediaKind::Audio, Direction::SendRecv);

    let mut offer = peer.create_offer(OfferOptions::default()).unwrap();
    offer.media_descriptions[0].mid = Some("tampered".into());

    let result = peer.set_local_description(Instant::now(), SdpType::Offer, offer);
    assert!(matches!(
        result,
        Err(quill_webrtc::peer::Error::OfferAltered)
    ));
}

#[test]
fn rollback_returns_to_stable() {
    let mut a = make_peer();
    let mut b = make_peer();

    a.add_transceiver(MediaKind::Audio, Direction::SendRecv);

    let offer = a.create_offer(OfferOptions::default()).unwrap();
    let now = Instant::now();

    b.set_remote_description(now, SdpType::Offer, through_the_wire(&offer))
        .unwrap();
    assert_eq!(b.signaling_state(), SignalingState::HaveRemoteOffer);
    assert_eq!(b.transceivers().count(), 1);

    b.set_remote_description(now, SdpType::Rollback, through_the_wire(&offer))
        .unwrap();
    assert_eq!(b.signaling_state(), SignalingState::Stable);
    // The provisional transceiver is gone again
    assert_eq!(b.transceivers().count(), 0);
}

#[test]
fn answer_carries_active_setup() {
    let mut a = make_peer();
    let mut b = make_peer();

    a.add_transceiver(MediaKind::Audio, Direction::SendRecv);

    let offer = a.create_offer(OfferOptions::default()).unwrap();
    b.set_remote_description(Instant::now(), SdpType::Offer, through_the_wire(&offer))
        .unwrap();

    let answer = b.create_answer().unwrap();
    assert!(matches!(
        answer.media_descriptions[0].setup,
        Some(Setup::Active)
    ));
}
