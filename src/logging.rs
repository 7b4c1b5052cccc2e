use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use chrono::{DateTime, Utc};

/// Environment variable selecting the log level
pub const LOG_LEVEL_ENV: &str = "STREAMPLAY_LOG_LEVEL";

/// Playback event kept in the bounded history
#[derive(Debug, Clone)]
pub struct PlaybackEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: PlaybackEventType,
    pub details: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEventType {
    PlaybackStarted,
    PlaybackPaused,
    PlaybackStopped,
    TrackChanged,
    TrackSkipped,
    FetchRetry,
    FetchFailed,
    DecodeError,
    Seek,
    BufferUnderrun,
    DeviceFault,
}

impl PlaybackEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackEventType::PlaybackStarted => "PLAYBACK_STARTED",
            PlaybackEventType::PlaybackPaused => "PLAYBACK_PAUSED",
            PlaybackEventType::PlaybackStopped => "PLAYBACK_STOPPED",
            PlaybackEventType::TrackChanged => "TRACK_CHANGED",
            PlaybackEventType::TrackSkipped => "TRACK_SKIPPED",
            PlaybackEventType::FetchRetry => "FETCH_RETRY",
            PlaybackEventType::FetchFailed => "FETCH_FAILED",
            PlaybackEventType::DecodeError => "DECODE_ERROR",
            PlaybackEventType::Seek => "SEEK",
            PlaybackEventType::BufferUnderrun => "BUFFER_UNDERRUN",
            PlaybackEventType::DeviceFault => "DEVICE_FAULT",
        }
    }
}

/// Initialize logging system with appropriate log level
pub fn init() -> Result<(), log::SetLoggerError> {
    let log_level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());

    let mut builder = env_logger::Builder::new();

    builder.format(|buf, record| {
        use std::io::Write;
        writeln!(
            buf,
            "{} [{}] [{}] {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });

    builder.filter_level(parse_level(&log_level));
    builder.try_init()?;

    info!("streamplay logging initialized with level: {}", log_level);
    Ok(())
}

fn parse_level(value: &str) -> log::LevelFilter {
    match value.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Bounded history of playback events, mirrored to the `log` macros
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<VecDeque<PlaybackEvent>>>,
    max_events: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events.min(1024)))),
            max_events: max_events.max(1),
        }
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<PlaybackEvent>> {
        // A panic while holding the lock leaves the history intact
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, event_type: PlaybackEventType, details: impl Into<String>) {
        let details = details.into();

        match event_type {
            PlaybackEventType::PlaybackStarted
            | PlaybackEventType::PlaybackPaused
            | PlaybackEventType::PlaybackStopped
            | PlaybackEventType::TrackChanged => {
                info!("[{}] {}", event_type.as_str(), details);
            }
            PlaybackEventType::Seek | PlaybackEventType::FetchRetry => {
                debug!("[{}] {}", event_type.as_str(), details);
            }
            PlaybackEventType::TrackSkipped
            | PlaybackEventType::BufferUnderrun
            | PlaybackEventType::FetchFailed => {
                warn!("[{}] {}", event_type.as_str(), details);
            }
            PlaybackEventType::DecodeError | PlaybackEventType::DeviceFault => {
                error!("[{}] {}", event_type.as_str(), details);
            }
        }

        let mut events = self.history();
        events.push_back(PlaybackEvent {
            timestamp: Utc::now(),
            event_type,
            details,
        });
        while events.len() > self.max_events {
            events.pop_front();
        }
    }

    pub fn track_changed(&self, from: Option<&str>, to: &str) {
        let details = match from {
            Some(from) => format!("{} -> {}", from, to),
            None => to.to_string(),
        };
        self.record(PlaybackEventType::TrackChanged, details);
    }

    pub fn track_skipped(&self, track: &str, reason: &str) {
        self.record(
            PlaybackEventType::TrackSkipped,
            format!("Skipping {}: {}", track, reason),
        );
    }

    /// Most recent events, oldest first
    pub fn recent(&self, count: usize) -> Vec<PlaybackEvent> {
        let events = self.history();
        let skip = events.len().saturating_sub(count);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn count(&self, event_type: PlaybackEventType) -> usize {
        self.history()
            .iter()
            .filter(|event| event.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.history().clear();
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
