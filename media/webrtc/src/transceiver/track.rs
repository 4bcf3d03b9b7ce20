use crate::sdp::MediaKind;

/// Handle identifying a media source or sink
///
/// Tracks carry no media themselves; packet delivery is keyed on the owning
/// transceiver (and the RID for simulcast tracks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    /// Opaque identifier, unique within the session
    pub id: String,
    pub kind: MediaKind,
    /// Ids of the media streams this track is part of (`a=msid`)
    pub stream_ids: Vec<String>,
    /// Simulcast encoding names offered for this track
    pub rids: Vec<String>,
}

impl Track {
    pub fn new(kind: MediaKind, id: impl Into<String>) -> Self {
        Track {
            id: id.into(),
            kind,
            stream_ids: vec![],
            rids: vec![],
        }
    }

    /// Generate a track with a random id
    pub fn generate(kind: MediaKind) -> Self {
        Track::new(kind, format!("track-{:08x}", rand::random::<u32>()))
    }

    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_ids.push(stream_id.into());
        self
    }

    pub fn with_rids(mut self, rids: impl IntoIterator<Item = String>) -> Self {
        self.rids.extend(rids);
        self
    }
}
