use common::{events, make_peer, negotiate};
use quill_webrtc::{
    peer::{OfferOptions, PeerConnectionEvent},
    sdp::MediaKind,
};
use sdp_types::{Direction, MediaType};

mod common;

#[test]
fn stop_and_add_recycles_the_slot() {
    let mut a = make_peer();
    let mut b = make_peer();

    let audio = a.add_transceiver(MediaKind::Audio, Direction::SendRecv);
    let video = a.add_transceiver(MediaKind::Video, Direction::SendRecv);

    negotiate(&mut a, &mut b);

    assert_eq!(a.transceivers().count(), 2);
    assert_eq!(b.transceivers().count(), 2);

    // Stop the audio and add another video before renegotiating
    a.stop_transceiver(audio).unwrap();
    a.add_transceiver(MediaKind::Video, Direction::SendRecv);

    let offer = a.create_offer(OfferOptions::default()).unwrap();

    // The stopped transceiver holds its slot with port zero; the list only
    // ever grows
    assert_eq!(offer.media_descriptions.len(), 3);
    assert_eq!(offer.media_descriptions[0].media.media_type, MediaType::Audio);
    assert_eq!(offer.media_descriptions[0].media.port, 0);
    assert_eq!(offer.media_descriptions[1].media.media_type, MediaType::Video);
    assert_eq!(offer.media_descriptions[1].media.port, 9);
    assert_eq!(offer.media_descriptions[2].media.media_type, MediaType::Video);
    assert_eq!(offer.media_descriptions[2].media.port, 9);

    negotiate(&mut a, &mut b);

    // Both sides end with two video transceivers and no audio
    for peer in [&a, &b] {
        assert_eq!(peer.transceivers().count(), 2);
        assert!(peer.transceivers().all(|t| t.kind() == MediaKind::Video));
    }

    assert!(a.transceiver(audio).is_none());
    assert!(a.transceiver(video).is_some());

    // b saw the incoming audio track end
    assert!(
        events(&mut b)
            .iter()
            .any(|e| matches!(e, PeerConnectionEvent::TrackEnded(..)))
    );

    // The freed slot is recycled by the next added transceiver, regardless
    // of its kind
    a.add_transceiver(MediaKind::Video, Direction::SendRecv);

    let offer = a.create_offer(OfferOptions::default()).unwrap();

    assert_eq!(offer.media_descriptions.len(), 3);
    assert_eq!(offer.media_descriptions[0].media.media_type, MediaType::Video);
    assert_eq!(offer.media_descriptions[0].media.port, 9);

    negotiate(&mut a, &mut b);

    assert_eq!(a.transceivers().count(), 3);
    assert_eq!(b.transceivers().count(), 3);
}

#[test]
fn mline_count_never_shrinks_without_additions() {
    let mut a = make_peer();
    let mut b = make_peer();

    let audio = a.add_transceiver(MediaKind::Audio, Direction::SendRecv);
    a.add_transceiver(MediaKind::Video, Direction::SendRecv);

    negotiate(&mut a, &mut b);

    a.stop_transceiver(audio).unwrap();
    negotiate(&mut a, &mut b);

    // Renegotiate once more without adding anything: the zeroed slot stays
    let offer = a.create_offer(OfferOptions::default()).unwrap();
    assert_eq!(offer.media_descriptions.len(), 2);
    assert_eq!(offer.media_descriptions[0].media.port, 0);
    assert_eq!(offer.media_descriptions[1].media.port, 9);
}

#[test]
fn mids_are_stable_across_renegotiations() {
    let mut a = make_peer();
    let mut b = make_peer();

    a.add_transceiver(MediaKind::Audio, Direction::SendRecv);

    negotiate(&mut a, &mut b);

    let mid_before = a.transceivers().next().unwrap().mid().unwrap().to_owned();

    a.add_transceiver(MediaKind::Video, Direction::SendRecv);

    negotiate(&mut a, &mut b);

    let mids: Vec<_> = a
        .transceivers()
        .filter_map(|t| t.mid().map(str::to_owned))
        .collect();

    assert_eq!(mids[0], mid_before);
    // The new transceiver got the next free integer mid
    assert_ne!(mids[1], mid_before);

    let b_mids: Vec<_> = b
        .transceivers()
        .filter_map(|t| t.mid().map(str::to_owned))
        .collect();

    assert_eq!(mids, b_mids);
}

#[test]
fn direction_change_propagates() {
    let mut a = make_peer();
    let mut b = make_peer();

    let id = a.add_transceiver(MediaKind::Audio, Direction::SendRecv);

    negotiate(&mut a, &mut b);

    // b answers recvonly, so a ends up sendonly
    assert_eq!(
        a.transceiver(id).unwrap().current_direction(),
        Some(Direction::SendOnly)
    );

    // a stops sending; with b only ever receiving, the meet is inactive
    a.set_transceiver_direction(id, Direction::RecvOnly).unwrap();
    negotiate(&mut a, &mut b);

    assert_eq!(
        a.transceiver(id).unwrap().current_direction(),
        Some(Direction::Inactive)
    );
    assert_eq!(
        b.transceivers().next().unwrap().current_direction(),
        Some(Direction::Inactive)
    );

    // b's track fired on the first offer and is muted now
    assert!(
        events(&mut b)
            .iter()
            .any(|e| matches!(e, PeerConnectionEvent::TrackMuted(..)))
    );
}
