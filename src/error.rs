use thiserror::Error;

/// Main daemon error type
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Playlist cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Command parse error: {0}")]
    Parse(#[from] crate::cli::ParseError),

    #[error("File error: {0}")]
    File(#[from] std::io::Error),

    #[error("Playback engine is not running")]
    EngineStopped,
}

impl PlayerError {
    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            PlayerError::Audio(err) => err.user_message(),
            PlayerError::Fetch(err) => err.user_message(),
            PlayerError::Decode(err) => err.user_message(),
            PlayerError::Config(err) => err.user_message(),
            PlayerError::Queue(err) => err.user_message(),
            PlayerError::Cache(err) => err.user_message(),
            PlayerError::Catalog(err) => err.user_message(),
            PlayerError::Parse(err) => format!("Command error: {}", err),
            PlayerError::File(err) => format!("File system error: {}", err),
            PlayerError::EngineStopped => "The playback engine has shut down".to_string(),
        }
    }

    /// Check if this error allows for automatic recovery
    pub fn is_recoverable(&self) -> bool {
        match self {
            PlayerError::Audio(err) => err.is_recoverable(),
            PlayerError::Fetch(err) => err.is_transient(),
            PlayerError::Decode(_) => false,
            PlayerError::Config(_) => true, // Defaults are always available
            PlayerError::Queue(_) => true,
            PlayerError::Cache(_) => true, // Falls back to the catalog
            PlayerError::Catalog(_) => false,
            PlayerError::Parse(_) => false,
            PlayerError::File(_) => false,
            PlayerError::EngineStopped => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PlayerError::Audio(_) => ErrorSeverity::Critical,
            PlayerError::Fetch(FetchError::Cancelled) => ErrorSeverity::Info,
            PlayerError::Fetch(_) => ErrorSeverity::Warning,
            PlayerError::Decode(DecodeError::ResourceExhaustion { .. }) => ErrorSeverity::Error,
            PlayerError::Decode(_) => ErrorSeverity::Warning,
            PlayerError::Config(_) => ErrorSeverity::Warning,
            PlayerError::Queue(QueueError::EmptyQueue) => ErrorSeverity::Info,
            PlayerError::Queue(_) => ErrorSeverity::Warning,
            PlayerError::Cache(_) => ErrorSeverity::Warning,
            PlayerError::Catalog(_) => ErrorSeverity::Error,
            PlayerError::Parse(_) => ErrorSeverity::Info,
            PlayerError::File(_) => ErrorSeverity::Error,
            PlayerError::EngineStopped => ErrorSeverity::Critical,
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Info => "INFO",
            ErrorSeverity::Warning => "WARNING",
            ErrorSeverity::Error => "ERROR",
            ErrorSeverity::Critical => "CRITICAL",
        }
    }

    pub fn log_level(&self) -> log::Level {
        match self {
            ErrorSeverity::Info => log::Level::Info,
            ErrorSeverity::Warning => log::Level::Warn,
            ErrorSeverity::Error => log::Level::Error,
            ErrorSeverity::Critical => log::Level::Error,
        }
    }
}

/// Audio output errors
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Unsupported sample format: {format}")]
    UnsupportedSampleFormat { format: String },

    #[error("Stream error: {0}")]
    StreamError(String),
}

impl AudioError {
    pub fn user_message(&self) -> String {
        match self {
            AudioError::DeviceNotFound { device } => {
                format!("Audio device '{}' is not available or has been disconnected", device)
            }
            AudioError::DeviceError(msg) => {
                format!("Failed to open the audio output: {}", msg)
            }
            AudioError::UnsupportedSampleFormat { format } => {
                format!("The audio device uses an unsupported sample format ({})", format)
            }
            AudioError::StreamError(msg) => {
                format!("Audio playback interrupted: {}", msg)
            }
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            AudioError::DeviceNotFound { .. } => true, // Can fallback to default device
            AudioError::DeviceError(_) => false,
            AudioError::UnsupportedSampleFormat { .. } => false,
            AudioError::StreamError(_) => true, // Can restart stream
        }
    }
}

/// Network transfer errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("No backend instances configured")]
    NoBackends,

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether another attempt against a different backend may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::TransientNetwork(_) | FetchError::MalformedResponse(_))
    }

    pub fn user_message(&self) -> String {
        match self {
            FetchError::TransientNetwork(msg) => format!("Network problem while streaming: {}", msg),
            FetchError::MalformedResponse(msg) => format!("A backend returned an invalid response: {}", msg),
            FetchError::RetriesExhausted { attempts, .. } => {
                format!("Track could not be downloaded after {} attempts and was skipped", attempts)
            }
            FetchError::NoBackends => "No backend instances are configured".to_string(),
            FetchError::Cancelled => "Download cancelled".to_string(),
            FetchError::Io(err) => format!("Cannot write downloaded data: {}", err),
        }
    }
}

/// Audio decoding errors
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Corrupted stream: {0}")]
    CodecCorruption(String),

    #[error("Unsupported stream: {0}")]
    UnsupportedStream(String),

    #[error("Cannot grow sample buffer by {requested} samples")]
    ResourceExhaustion { requested: usize },
}

impl DecodeError {
    pub fn user_message(&self) -> String {
        match self {
            DecodeError::CodecCorruption(msg) => {
                format!("Audio stream appears to be corrupted: {}", msg)
            }
            DecodeError::UnsupportedStream(msg) => {
                format!("Audio stream is not Ogg/Vorbis: {}", msg)
            }
            DecodeError::ResourceExhaustion { requested } => {
                format!("Out of memory while buffering {} samples", requested)
            }
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found")]
    ConfigDirNotFound,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            ConfigError::ConfigDirNotFound => {
                "Cannot find or create configuration directory".to_string()
            }
            ConfigError::IoError(err) => {
                format!("Cannot access configuration file: {}", err)
            }
            ConfigError::SerializationError(_) => {
                "Failed to save configuration settings".to_string()
            }
            ConfigError::DeserializationError(_) => {
                "Configuration file is corrupted or has invalid format".to_string()
            }
        }
    }
}

/// Queue management errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue is empty")]
    EmptyQueue,

    #[error("Invalid index: {index}")]
    InvalidIndex { index: usize },
}

impl QueueError {
    pub fn user_message(&self) -> String {
        match self {
            QueueError::EmptyQueue => "No tracks in queue - play a track, album or playlist first".to_string(),
            QueueError::InvalidIndex { index } => {
                format!("Track number {} is not valid for current queue", index + 1)
            }
        }
    }
}

/// Playlist cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache record: {0}")]
    Corrupt(String),

    #[error("Field {field} is {len} bytes, at most {max} allowed")]
    FieldTooLong { field: &'static str, len: usize, max: usize },
}

impl CacheError {
    pub fn user_message(&self) -> String {
        match self {
            CacheError::Io(err) => format!("Cannot access the playlist cache: {}", err),
            CacheError::Corrupt(msg) => format!("Playlist cache is damaged ({}); it will be rebuilt", msg),
            CacheError::FieldTooLong { field, .. } => {
                format!("Playlist cannot be cached: {} is too long", field)
            }
        }
    }
}

/// Catalog lookup errors
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Invalid catalog document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CatalogError {
    pub fn user_message(&self) -> String {
        match self {
            CatalogError::NotFound { kind, id } => format!("The {} '{}' does not exist", kind, id),
            CatalogError::Fetch(err) => err.user_message(),
            CatalogError::Parse(_) => "The catalog returned data that could not be understood".to_string(),
            CatalogError::Io(err) => format!("Cannot read cached catalog data: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_player_error_from_audio_error() {
        let audio_error = AudioError::DeviceNotFound {
            device: "Test Device".to_string(),
        };
        let player_error: PlayerError = audio_error.into();

        match player_error {
            PlayerError::Audio(AudioError::DeviceNotFound { device }) => {
                assert_eq!(device, "Test Device");
            }
            _ => panic!("Expected Audio error variant"),
        }
    }

    #[test]
    fn test_player_error_from_fetch_error() {
        let player_error: PlayerError = FetchError::TransientNetwork("reset".to_string()).into();
        assert!(player_error.is_recoverable());
        assert_eq!(player_error.severity(), ErrorSeverity::Warning);

        let player_error: PlayerError = FetchError::RetriesExhausted { attempts: 3, last: "reset".to_string() }.into();
        assert!(!player_error.is_recoverable());
    }

    #[test]
    fn test_fetch_error_classification() {
        assert!(FetchError::TransientNetwork("timeout".into()).is_transient());
        assert!(FetchError::MalformedResponse("HTTP 502".into()).is_transient());
        assert!(!FetchError::Cancelled.is_transient());
        assert!(!FetchError::NoBackends.is_transient());
        assert!(!FetchError::Io(io::Error::new(io::ErrorKind::Other, "disk")).is_transient());
    }

    #[test]
    fn test_decode_error_display() {
        let error = DecodeError::CodecCorruption("bad packet".to_string());
        assert_eq!(format!("{}", error), "Corrupted stream: bad packet");

        let error = DecodeError::ResourceExhaustion { requested: 42 };
        assert_eq!(format!("{}", error), "Cannot grow sample buffer by 42 samples");
    }

    #[test]
    fn test_cache_error_display() {
        let error = CacheError::FieldTooLong { field: "id", len: 30, max: 22 };
        assert_eq!(format!("{}", error), "Field id is 30 bytes, at most 22 allowed");
        assert!(error.user_message().contains("id"));
    }

    #[test]
    fn test_severity_levels() {
        let error: PlayerError = AudioError::DeviceError("busy".into()).into();
        assert_eq!(error.severity(), ErrorSeverity::Critical);
        assert_eq!(error.severity().log_level(), log::Level::Error);

        let error: PlayerError = QueueError::EmptyQueue.into();
        assert_eq!(error.severity(), ErrorSeverity::Info);
        assert_eq!(error.severity().as_str(), "INFO");
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "Permission denied");
        let config_error = ConfigError::IoError(io_error);
        let player_error = PlayerError::Config(config_error);

        let mut current_error: &dyn Error = &player_error;
        let mut error_count = 0;

        while let Some(source) = current_error.source() {
            current_error = source;
            error_count += 1;
        }

        assert!(error_count >= 1);
    }
}
