use crate::error::{ErrorSeverity, PlayerError};
use crate::models::{DownloadState, PlayerStatus, Track};
use crate::queue::cache::CachedPlaylist;
use std::time::Duration;

/// Status and error formatting for the control console
pub struct StatusDisplay;

impl StatusDisplay {
    /// Display comprehensive player status
    pub fn display_full_status(status: &PlayerStatus) {
        println!("┌─ Player Status ─────────────────────────────────────────┐");

        match &status.current_track {
            Some(track) => {
                Self::display_track_info(track);
                Self::display_playback_info(status, track);
            }
            None => {
                println!("│ No track loaded");
                println!("│ Status: {}", status.state.as_str());
            }
        }

        println!("│");
        println!("│ Volume: {}%", (status.volume * 100.0).round() as u8);
        println!(
            "│ Shuffle: {} | Loop: {}",
            if status.shuffle { "on" } else { "off" },
            status.loop_mode.as_str()
        );
        println!("│ {}", Self::queue_summary(status));
        if let Some(stream) = status.stream {
            println!("│ Stream: {}", stream);
        }
        if status.underruns > 0 {
            println!("│ Underruns: {}", status.underruns);
        }
        println!("└─────────────────────────────────────────────────────────┘");
    }

    /// One-line status summary
    pub fn compact_status(status: &PlayerStatus) -> String {
        match &status.current_track {
            Some(track) => format!(
                "{} | {} - {} | {}/{} | {}/{}",
                status.state.as_str(),
                Self::truncate(track.artist_name(), 25),
                Self::truncate(track.display_name(), 30),
                Self::format_duration(Duration::from_micros(status.position_us)),
                Self::format_duration(track.duration_hint),
                status.queue_index.map_or(0, |i| i + 1),
                status.queue_len
            ),
            None => format!("{} | No track loaded", status.state.as_str()),
        }
    }

    /// Queue length with how many tracks are downloaded or failed
    pub fn queue_summary(status: &PlayerStatus) -> String {
        let count = |state: DownloadState| status.download_states.iter().filter(|s| **s == state).count();
        format!(
            "Queue: {} tracks ({} ready, {} failed)",
            status.queue_len,
            count(DownloadState::Ready),
            count(DownloadState::Failed)
        )
    }

    /// One line per cached album or playlist, most recently played first
    pub fn playlist_lines(records: &[CachedPlaylist]) -> Vec<String> {
        let mut sorted: Vec<&CachedPlaylist> = records.iter().collect();
        sorted.sort_by_key(|r| std::cmp::Reverse(r.playlist.last_played()));
        sorted
            .into_iter()
            .map(|r| {
                let last_played = chrono::DateTime::from_timestamp(r.playlist.last_played(), 0)
                    .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
                format!(
                    "{} {} ({} tracks, last played {})",
                    if r.playlist.is_album { "album   " } else { "playlist" },
                    Self::truncate(&r.playlist.name, 40),
                    r.tracks.len(),
                    last_played
                )
            })
            .collect()
    }

    /// Display error message with severity marker
    pub fn display_error(error: &PlayerError) {
        let marker = match error.severity() {
            ErrorSeverity::Info => "ℹ",
            ErrorSeverity::Warning => "⚠",
            ErrorSeverity::Error | ErrorSeverity::Critical => "✖",
        };
        eprintln!("{} {}", marker, error.user_message());
    }

    fn display_track_info(track: &Track) {
        println!("│ Track: {}", Self::truncate(track.display_name(), 50));
        println!("│ Artist: {}", Self::truncate(track.artist_name(), 49));
        if let Some(playlist) = &track.playlist {
            let kind = if playlist.is_album { "Album" } else { "Playlist" };
            println!("│ {}: {}", kind, Self::truncate(&playlist.name, 48));
        }
    }

    fn display_playback_info(status: &PlayerStatus, track: &Track) {
        let position = Duration::from_micros(status.position_us);
        println!("│");
        println!("│ Status: {}", status.state.as_str());
        println!(
            "│ Position: {} / {}",
            Self::format_duration(position),
            Self::format_duration(track.duration_hint)
        );

        let progress = Self::progress(position, track.duration_hint);
        let bar_width = 40;
        let filled = (progress * bar_width as f32) as usize;
        println!(
            "│ Progress: [{}{}] {:.1}%",
            "█".repeat(filled),
            "░".repeat(bar_width - filled),
            progress * 100.0
        );
    }

    fn progress(position: Duration, duration: Duration) -> f32 {
        if duration.is_zero() {
            return 0.0;
        }
        (position.as_secs_f32() / duration.as_secs_f32()).clamp(0.0, 1.0)
    }

    fn format_duration(duration: Duration) -> String {
        let total_seconds = duration.as_secs();
        format!("{:02}:{:02}", total_seconds / 60, total_seconds % 60)
    }

    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{}...", kept)
        }
    }
}
