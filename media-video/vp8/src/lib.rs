//! VP8 RTP payload tools
//!
//! Contains the [`Vp8PayloadDescriptor`] defined in
//! [RFC7741](https://www.rfc-editor.org/rfc/rfc7741#section-4.2) and the
//! [`Vp8Munger`] which rewrites descriptor fields so that a receiver sees one
//! continuous VP8 stream while the sender switches between simulcast
//! encodings.

mod descriptor;
mod munger;

pub use descriptor::{ParseVp8DescriptorError, PictureId, Vp8PayloadDescriptor};
pub use munger::Vp8Munger;
