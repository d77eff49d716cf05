//! Media track descriptors exposed through `tracks()`

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Media type as written on an SDP `m=` line
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Who produced a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Participant {
    Local,
    Bot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    pub id: String,
    pub kind: MediaKind,
    pub participant: Participant,
}

impl TrackInfo {
    pub fn new(id: impl Into<String>, kind: MediaKind, participant: Participant) -> Self {
        Self {
            id: id.into(),
            kind,
            participant,
        }
    }
}

/// Current local and remote tracks, by kind
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Tracks {
    pub local_audio: Option<TrackInfo>,
    pub local_video: Option<TrackInfo>,
    pub bot_audio: Option<TrackInfo>,
    pub bot_video: Option<TrackInfo>,
}

impl Tracks {
    /// Record a started track in its slot
    pub fn insert(&mut self, track: TrackInfo) {
        let slot = self.slot_mut(track.participant, track.kind);
        *slot = Some(track);
    }

    /// Clear the slot holding `track_id`; returns the removed track
    pub fn remove(&mut self, track_id: &str) -> Option<TrackInfo> {
        for slot in [
            &mut self.local_audio,
            &mut self.local_video,
            &mut self.bot_audio,
            &mut self.bot_video,
        ] {
            if slot.as_ref().map(|t| t.id.as_str()) == Some(track_id) {
                return slot.take();
            }
        }
        None
    }

    fn slot_mut(&mut self, participant: Participant, kind: MediaKind) -> &mut Option<TrackInfo> {
        match (participant, kind) {
            (Participant::Local, MediaKind::Audio) => &mut self.local_audio,
            (Participant::Local, MediaKind::Video) => &mut self.local_video,
            (Participant::Bot, MediaKind::Audio) => &mut self.bot_audio,
            (Participant::Bot, MediaKind::Video) => &mut self.bot_video,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracks_insert_and_remove() {
        let mut tracks = Tracks::default();
        tracks.insert(TrackInfo::new("mic", MediaKind::Audio, Participant::Local));
        tracks.insert(TrackInfo::new("bot-a", MediaKind::Audio, Participant::Bot));

        assert_eq!(tracks.local_audio.as_ref().unwrap().id, "mic");
        assert_eq!(tracks.remove("bot-a").unwrap().participant, Participant::Bot);
        assert!(tracks.bot_audio.is_none());
        assert!(tracks.remove("missing").is_none());
    }
}
