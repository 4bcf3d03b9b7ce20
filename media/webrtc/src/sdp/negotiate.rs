//! Validation of remote descriptions and codec matching

use crate::{
    peer::Error,
    sdp::{Codecs, NegotiatedCodec, read_feedback},
};
use sdp_types::{FingerprintAlgorithm, MediaDescription, SessionDescription};

/// Checks a remote description against the requirements this endpoint puts
/// on any session it participates in: usable mids, one exhaustive BUNDLE
/// group, consistent ICE credentials and a SHA-256 DTLS fingerprint.
pub(crate) fn validate_remote_description(desc: &SessionDescription) -> Result<(), Error> {
    let active = || desc.media_descriptions.iter().filter(|m| m.media.port != 0);

    // Unique mid on every active media section
    let mut mids: Vec<&str> = vec![];

    for (mline, media_desc) in desc.media_descriptions.iter().enumerate() {
        let Some(mid) = &media_desc.mid else {
            if media_desc.media.port == 0 {
                continue;
            }

            return Err(Error::MissingMid { mline });
        };

        if mids.contains(&mid.as_str()) {
            return Err(Error::DuplicatedMid {
                mid: mid.to_string(),
            });
        }

        mids.push(mid.as_str());
    }

    // A single BUNDLE group covering every active media section
    let mut bundle_groups = desc.group.iter().filter(|g| g.typ == "BUNDLE");

    let bundle = bundle_groups.next().ok_or(Error::MissingBundleGroup)?;

    if bundle_groups.next().is_some() {
        return Err(Error::MultipleBundleGroups);
    }

    for media_desc in active() {
        let mid = media_desc.mid.as_ref().expect("checked above");

        if !bundle.mids.iter().any(|m| m == mid.as_str()) {
            return Err(Error::NonExhaustiveBundleGroup);
        }
    }

    // ICE credentials: session level or equal on every media section
    remote_ice_credentials(desc)?;

    // DTLS fingerprint, sha-256 only
    remote_sha256_fingerprint(desc)?;

    Ok(())
}

/// Extract the remote `(ufrag, pwd)`, enforcing consistency across media
/// sections
pub(crate) fn remote_ice_credentials(desc: &SessionDescription) -> Result<(String, String), Error> {
    let session_ufrag = desc.ice_ufrag.as_ref().map(|u| u.ufrag.as_str());
    let session_pwd = desc.ice_pwd.as_ref().map(|p| p.pwd.as_str());

    let mut ufrag = session_ufrag;
    let mut pwd = session_pwd;

    for media_desc in desc.media_descriptions.iter().filter(|m| m.media.port != 0) {
        let media_ufrag = media_desc.ice_ufrag.as_ref().map(|u| u.ufrag.as_str());
        let media_pwd = media_desc.ice_pwd.as_ref().map(|p| p.pwd.as_str());

        match (ufrag, media_ufrag) {
            (Some(a), Some(b)) if a != b => return Err(Error::ConflictingIceCredentials),
            (None, Some(b)) => ufrag = Some(b),
            _ => {}
        }

        match (pwd, media_pwd) {
            (Some(a), Some(b)) if a != b => return Err(Error::ConflictingIceCredentials),
            (None, Some(b)) => pwd = Some(b),
            _ => {}
        }
    }

    match (ufrag, pwd) {
        (Some(ufrag), Some(pwd)) => Ok((ufrag.to_owned(), pwd.to_owned())),
        (None, Some(..)) => Err(Error::MissingIceUfrag),
        (Some(..), None) => Err(Error::MissingIcePwd),
        (None, None) => Err(Error::MissingIceCredentials),
    }
}

/// Extract the remote SHA-256 certificate fingerprint
///
/// Fingerprints may be placed at the session level or repeated per media
/// section; repeated ones must not differ.
pub(crate) fn remote_sha256_fingerprint(desc: &SessionDescription) -> Result<Vec<u8>, Error> {
    let mut all = desc.fingerprint.iter().chain(
        desc.media_descriptions
            .iter()
            .filter(|m| m.media.port != 0)
            .flat_map(|m| m.fingerprint.iter()),
    );

    let first = all.next().ok_or(Error::MissingCertFingerprint)?;

    for other in all {
        if other.algorithm != first.algorithm || other.fingerprint != first.fingerprint {
            return Err(Error::ConflictingCertFingerprints);
        }
    }

    if first.algorithm != FingerprintAlgorithm::SHA256 {
        return Err(Error::UnsupportedCertFingerprintHashFunction);
    }

    Ok(first.fingerprint.clone())
}

/// Match the locally configured codecs against a remote media description
///
/// Returns the supported codecs in local preference order, with payload
/// type numbers adopted from the remote description and RTX payload types
/// resolved through their `apt` format parameter. RTCP feedback is reduced
/// to the intersection of both sides.
pub(crate) fn negotiate_codecs(local: &Codecs, desc: &MediaDescription) -> Vec<NegotiatedCodec> {
    let remote_feedback = read_feedback(desc);

    let mut negotiated = vec![];

    for codec in &local.codecs {
        let Some(rtpmap) = desc.rtpmap.iter().find(|rtpmap| {
            rtpmap.encoding.eq_ignore_ascii_case(codec.name.as_ref())
                && rtpmap.clock_rate == codec.clock_rate
        }) else {
            continue;
        };

        let pt = rtpmap.payload;

        let rtx_pt = if codec.allow_rtx {
            find_rtx_pt(desc, pt, codec.clock_rate)
        } else {
            None
        };

        let feedback = codec
            .feedback
            .iter()
            .copied()
            .filter(|fb| {
                remote_feedback
                    .iter()
                    .any(|(remote_pt, remote_fb)| {
                        remote_pt.is_none_or(|p| p == pt) && remote_fb == fb
                    })
            })
            .collect();

        negotiated.push(NegotiatedCodec {
            pt,
            rtx_pt,
            name: codec.name.clone(),
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            fmtp: codec.fmtp.clone(),
            feedback,
        });
    }

    negotiated
}

/// Find the RTX payload type whose `apt` format parameter points at `pt`
fn find_rtx_pt(desc: &MediaDescription, pt: u8, clock_rate: u32) -> Option<u8> {
    desc.rtpmap.iter().find_map(|rtpmap| {
        if !rtpmap.encoding.eq_ignore_ascii_case("rtx") || rtpmap.clock_rate != clock_rate {
            return None;
        }

        let fmtp = desc.fmtp.iter().find(|fmtp| fmtp.format == rtpmap.payload)?;

        let apt = fmtp
            .params
            .split(';')
            .find_map(|param| param.trim().strip_prefix("apt="))?;

        (apt.parse::<u8>().ok()? == pt).then_some(rtpmap.payload)
    })
}
