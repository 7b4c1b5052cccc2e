use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fetch progress of a track's encoded audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadState {
    NotFetched,
    Fetching,
    Ready,
    Failed,
}

/// A named, ordered collection of tracks with shared artwork.
///
/// Shared between tracks through `Arc`; the strong count is the playlist's
/// reference count. It is dropped when the last track pointing at it goes
/// away, never before. Only `last_played` changes after creation.
#[derive(Debug)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub image_url: String,
    pub is_album: bool,
    pub track_count: u32,
    last_played: AtomicI64,
}

impl Playlist {
    pub fn new(id: String, name: String, image_url: String, is_album: bool, track_count: u32) -> Self {
        Self {
            id,
            name,
            image_url,
            is_album,
            track_count,
            last_played: AtomicI64::new(0),
        }
    }

    /// Unix timestamp (seconds) of the last time playback started from this playlist
    pub fn last_played(&self) -> i64 {
        self.last_played.load(Ordering::Relaxed)
    }

    pub fn set_last_played(&self, timestamp: i64) {
        self.last_played.store(timestamp, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.set_last_played(chrono::Utc::now().timestamp());
    }
}

impl PartialEq for Playlist {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.image_url == other.image_url
            && self.is_album == other.is_album
            && self.track_count == other.track_count
            && self.last_played() == other.last_played()
    }
}

/// One playable audio item
#[derive(Debug, Clone)]
pub struct Track {
    pub id: String,
    /// Locator of the encoded audio, resolved against a backend instance
    pub source_locator: String,
    pub duration_hint: Duration,
    pub title: String,
    pub artist: String,
    pub art_url: String,
    pub download_state: DownloadState,
    pub playlist: Option<Arc<Playlist>>,
}

impl Track {
    pub fn new(id: impl Into<String>, source_locator: impl Into<String>, duration_hint: Duration) -> Self {
        Self {
            id: id.into(),
            source_locator: source_locator.into(),
            duration_hint,
            title: String::new(),
            artist: String::new(),
            art_url: String::new(),
            download_state: DownloadState::NotFetched,
            playlist: None,
        }
    }

    pub fn with_details(mut self, title: impl Into<String>, artist: impl Into<String>, art_url: impl Into<String>) -> Self {
        self.title = title.into();
        self.artist = artist.into();
        self.art_url = art_url.into();
        self
    }

    pub fn with_playlist(mut self, playlist: Arc<Playlist>) -> Self {
        self.playlist = Some(playlist);
        self
    }

    /// Get the display name for this track (title or id)
    pub fn display_name(&self) -> &str {
        if self.title.is_empty() {
            &self.id
        } else {
            &self.title
        }
    }

    /// Get the artist name or "Unknown Artist"
    pub fn artist_name(&self) -> &str {
        if self.artist.is_empty() {
            "Unknown Artist"
        } else {
            &self.artist
        }
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.source_locator == other.source_locator
            && self.duration_hint == other.duration_hint
            && self.title == other.title
            && self.artist == other.artist
            && self.art_url == other.art_url
    }
}

/// Stream parameters published by the decoder once the headers are parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub channels: u16,
    pub sample_rate: u32,
}

impl StreamParams {
    pub fn new(channels: u16, sample_rate: u32) -> Self {
        Self { channels, sample_rate }
    }

    /// Interleaved samples per second of audio
    pub fn samples_per_second(&self) -> usize {
        self.channels as usize * self.sample_rate as usize
    }

    /// Convert an interleaved sample offset into microseconds
    pub fn samples_to_micros(&self, samples: usize) -> u64 {
        let per_second = self.samples_per_second() as u64;
        if per_second == 0 {
            return 0;
        }
        samples as u64 * 1_000_000 / per_second
    }

    /// Convert microseconds into an interleaved sample offset aligned to a frame
    pub fn micros_to_samples(&self, micros: u64) -> usize {
        let frames = micros as u128 * self.sample_rate as u128 / 1_000_000;
        frames as usize * self.channels as usize
    }
}

impl fmt::Display for StreamParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} channel{}",
            self.sample_rate,
            self.channels,
            if self.channels == 1 { "" } else { "s" }
        )
    }
}

/// Repeat policy applied when a track ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    None,
    Track,
    Playlist,
}

impl LoopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopMode::None => "none",
            LoopMode::Track => "track",
            LoopMode::Playlist => "playlist",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "none" | "off" => Some(LoopMode::None),
            "track" | "one" => Some(LoopMode::Track),
            "playlist" | "all" => Some(LoopMode::Playlist),
            _ => None,
        }
    }
}

/// Playback state reported to the control layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Stopped => "Stopped",
            PlaybackState::Playing => "Playing",
            PlaybackState::Paused => "Paused",
        }
    }
}

/// Snapshot of the engine's state for the control layer
#[derive(Debug, Clone)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    pub current_track: Option<Track>,
    pub queue_index: Option<usize>,
    pub queue_len: usize,
    pub position_us: u64,
    pub volume: f32,
    pub shuffle: bool,
    pub loop_mode: LoopMode,
    pub stream: Option<StreamParams>,
    /// Download state of every queued track, in queue order
    pub download_states: Vec<DownloadState>,
    /// Callback periods that ran out of decoded audio
    pub underruns: u64,
}

impl PlayerStatus {
    pub fn new() -> Self {
        Self {
            state: PlaybackState::Stopped,
            current_track: None,
            queue_index: None,
            queue_len: 0,
            position_us: 0,
            volume: 1.0,
            shuffle: false,
            loop_mode: LoopMode::None,
            stream: None,
            download_states: Vec::new(),
            underruns: 0,
        }
    }
}

impl Default for PlayerStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_display_name_falls_back_to_id() {
        let track = Track::new("4uLU6hMCjMI75M1A2tKUQC", "spotify:track:4uLU6hMCjMI75M1A2tKUQC", Duration::from_secs(212));
        assert_eq!(track.display_name(), "4uLU6hMCjMI75M1A2tKUQC");
        assert_eq!(track.artist_name(), "Unknown Artist");

        let track = track.with_details("Never Gonna Give You Up", "Rick Astley", "");
        assert_eq!(track.display_name(), "Never Gonna Give You Up");
        assert_eq!(track.artist_name(), "Rick Astley");
    }

    #[test]
    fn test_playlist_reference_count_follows_tracks() {
        let playlist = Arc::new(Playlist::new("p".into(), "Mix".into(), String::new(), false, 2));
        let a = Track::new("a", "uri:a", Duration::ZERO).with_playlist(Arc::clone(&playlist));
        let b = Track::new("b", "uri:b", Duration::ZERO).with_playlist(Arc::clone(&playlist));
        assert_eq!(Arc::strong_count(&playlist), 3);

        drop(a);
        assert_eq!(Arc::strong_count(&playlist), 2);

        // A playing track keeps the playlist alive after the queue lets go of it
        let weak = Arc::downgrade(&playlist);
        drop(playlist);
        assert!(weak.upgrade().is_some());
        drop(b);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_stream_params_conversions() {
        let params = StreamParams::new(2, 44100);
        assert_eq!(params.samples_per_second(), 88200);
        assert_eq!(params.samples_to_micros(88200), 1_000_000);
        assert_eq!(params.micros_to_samples(500_000), 44100);
        // Offsets are always frame aligned
        assert_eq!(params.micros_to_samples(11) % 2, 0);
        assert_eq!(params.to_string(), "44100 Hz, 2 channels");
    }

    #[test]
    fn test_loop_mode_parse() {
        assert_eq!(LoopMode::parse("Track"), Some(LoopMode::Track));
        assert_eq!(LoopMode::parse("all"), Some(LoopMode::Playlist));
        assert_eq!(LoopMode::parse("off"), Some(LoopMode::None));
        assert_eq!(LoopMode::parse("sometimes"), None);
        assert_eq!(LoopMode::Playlist.as_str(), "playlist");
    }

    #[test]
    fn test_playlist_last_played_is_mutable() {
        let playlist = Playlist::new("p".into(), "Mix".into(), String::new(), true, 0);
        assert_eq!(playlist.last_played(), 0);
        playlist.touch();
        assert!(playlist.last_played() > 0);
    }
}
