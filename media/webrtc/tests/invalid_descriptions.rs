use bytesstr::BytesStr;
use common::make_peer;
use quill_webrtc::peer::{Error, SdpType};
use sdp_types::SessionDescription;
use std::time::Instant;

mod common;

const FINGERPRINT: &str = "a=fingerprint:SHA-256 B5:38:75:EC:07:2E:3B:3A:B0:76:5F:4C:53:AD:28:96:B3:42:D1:98:3F:2D:05:A8:D2:1A:DB:E5:C7:AA:41:01";

fn offer(extra_session_lines: &str, media_sections: &str) -> SessionDescription {
    let sdp = format!(
        "v=0\n\
         o=- 123 1 IN IP4 127.0.0.1\n\
         s=-\n\
         c=IN IP4 127.0.0.1\n\
         t=0 0\n\
         a=ice-ufrag:abcd1234\n\
         a=ice-pwd:abcdefghijklmnopqrstuvwx\n\
         {extra_session_lines}\
         {media_sections}"
    );

    SessionDescription::parse(&BytesStr::from(sdp)).unwrap()
}

fn audio_section(mid: &str) -> String {
    format!(
        "m=audio 9 UDP/TLS/RTP/SAVPF 111\n\
         a=sendrecv\n\
         a=mid:{mid}\n\
         a=setup:actpass\n\
         a=rtpmap:111 opus/48000/2\n"
    )
}

fn apply(sdp: SessionDescription) -> Result<(), Error> {
    let mut peer = make_peer();
    peer.set_remote_description(Instant::now(), SdpType::Offer, sdp)
}

#[test]
fn missing_bundle_group() {
    let sdp = offer(&format!("{FINGERPRINT}\n"), &audio_section("0"));

    assert!(matches!(apply(sdp), Err(Error::MissingBundleGroup)));
}

#[test]
fn non_exhaustive_bundle_group() {
    let sdp = offer(
        &format!("a=group:BUNDLE 0\n{FINGERPRINT}\n"),
        &format!("{}{}", audio_section("0"), audio_section("1")),
    );

    assert!(matches!(apply(sdp), Err(Error::NonExhaustiveBundleGroup)));
}

#[test]
fn duplicated_mid() {
    let sdp = offer(
        &format!("a=group:BUNDLE 0\n{FINGERPRINT}\n"),
        &format!("{}{}", audio_section("0"), audio_section("0")),
    );

    assert!(matches!(apply(sdp), Err(Error::DuplicatedMid { .. })));
}

#[test]
fn missing_mid() {
    let sdp = offer(
        &format!("a=group:BUNDLE 0\n{FINGERPRINT}\n"),
        "m=audio 9 UDP/TLS/RTP/SAVPF 111\n\
         a=sendrecv\n\
         a=setup:actpass\n\
         a=rtpmap:111 opus/48000/2\n",
    );

    assert!(matches!(apply(sdp), Err(Error::MissingMid { mline: 0 })));
}

#[test]
fn missing_fingerprint() {
    let sdp = offer("a=group:BUNDLE 0\n", &audio_section("0"));

    assert!(matches!(apply(sdp), Err(Error::MissingCertFingerprint)));
}

#[test]
fn unsupported_fingerprint_hash() {
    let sdp = offer(
        "a=group:BUNDLE 0\n\
         a=fingerprint:SHA-1 B5:38:75:EC:07:2E:3B:3A:B0:76:5F:4C:53:AD:28:96:B3:42:D1:98\n",
        &audio_section("0"),
    );

    assert!(matches!(
        apply(sdp),
        Err(Error::UnsupportedCertFingerprintHashFunction)
    ));
}

#[test]
fn missing_ice_credentials() {
    let sdp = format!(
        "v=0\n\
         o=- 123 1 IN IP4 127.0.0.1\n\
         s=-\n\
         c=IN IP4 127.0.0.1\n\
         t=0 0\n\
         a=group:BUNDLE 0\n\
         {FINGERPRINT}\n\
         {}",
        audio_section("0")
    );

    let sdp = SessionDescription::parse(&BytesStr::from(sdp)).unwrap();

    assert!(matches!(apply(sdp), Err(Error::MissingIceCredentials)));
}

#[test]
fn conflicting_ice_credentials() {
    let media = format!(
        "m=audio 9 UDP/TLS/RTP/SAVPF 111\n\
         a=sendrecv\n\
         a=mid:0\n\
         a=setup:actpass\n\
         a=ice-ufrag:other123\n\
         a=ice-pwd:anotherpasswordanotherpass\n\
         a=rtpmap:111 opus/48000/2\n"
    );

    let sdp = offer(&format!("a=group:BUNDLE 0\n{FINGERPRINT}\n"), &media);

    assert!(matches!(apply(sdp), Err(Error::ConflictingIceCredentials)));
}

#[test]
fn answer_in_stable_is_an_invalid_transition() {
    let sdp = offer(
        &format!("a=group:BUNDLE 0\n{FINGERPRINT}\n"),
        &audio_section("0"),
    );

    let mut peer = make_peer();
    let result = peer.set_remote_description(Instant::now(), SdpType::Answer, sdp);

    assert!(matches!(result, Err(Error::InvalidTransition { .. })));
}

#[test]
fn add_ice_candidate_requires_remote_description() {
    let mut peer = make_peer();

    let result = peer.add_ice_candidate("candidate:1 1 UDP 2122252543 192.0.2.1 5000 typ host");

    assert!(matches!(result, Err(Error::NoRemoteDescription)));
}
