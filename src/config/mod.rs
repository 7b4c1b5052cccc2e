use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::ConfigError;

/// Daemon configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interchangeable backend base URLs; one is picked at random per attempt
    pub backend_instances: Vec<String>,
    /// Maximum number of concurrent transfers
    pub max_connections: usize,
    /// Attempts per transfer before it is reported as failed
    pub retry_budget: u32,
    /// Seconds to wait for the next chunk of a response
    pub read_timeout_secs: u64,
    pub cache_directory: PathBuf,
    /// Consecutive zero-progress decode runs treated as an implicit end of stream
    pub stall_threshold: u32,
    pub tick_interval_ms: u64,
    pub default_volume: f32,
    /// Fixed gain applied on top of the volume
    pub gain_trim: f32,
    pub preferred_device: Option<String>,
    /// Seconds of audio the sample buffer is sized for when the duration is unknown
    pub initial_buffer_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend_instances: Vec::new(),
            max_connections: 4,
            retry_budget: 3,
            read_timeout_secs: 15,
            cache_directory: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("streamplay"),
            stall_threshold: 5,
            tick_interval_ms: 50,
            default_volume: 0.8,
            gain_trim: 1.0,
            preferred_device: None,
            initial_buffer_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Clamp values that would make the engine unusable
    pub fn sanitized(mut self) -> Self {
        self.max_connections = self.max_connections.max(1);
        self.retry_budget = self.retry_budget.max(1);
        self.read_timeout_secs = self.read_timeout_secs.max(1);
        self.stall_threshold = self.stall_threshold.max(1);
        self.tick_interval_ms = self.tick_interval_ms.clamp(1, 1000);
        self.default_volume = self.default_volume.clamp(0.0, 1.0);
        if !self.gain_trim.is_finite() || self.gain_trim < 0.0 {
            self.gain_trim = 1.0;
        }
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn catalog_cache_directory(&self) -> PathBuf {
        self.cache_directory.join("catalog")
    }

    pub fn playlist_cache_path(&self) -> PathBuf {
        self.cache_directory.join("playlists.bin")
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    config: EngineConfig,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::with_path(config_path)
    }

    /// Load the configuration from an explicit file
    pub fn with_path(config_path: PathBuf) -> Result<Self, ConfigError> {
        let config = match Self::load_config(&config_path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring configuration at {}: {}", config_path.display(), e);
                EngineConfig::default()
            }
        };

        Ok(Self {
            config: config.sanitized(),
            config_path,
        })
    }

    pub fn get_config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update_config<F>(&mut self, updater: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut EngineConfig),
    {
        updater(&mut self.config);
        self.config = self.config.clone().sanitized();
        self.save_config()
    }

    pub fn set_volume(&mut self, volume: f32) -> Result<(), ConfigError> {
        self.config.default_volume = volume.clamp(0.0, 1.0);
        self.save_config()
    }

    fn get_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or(ConfigError::ConfigDirNotFound)?
            .join("streamplay");

        std::fs::create_dir_all(&config_dir)?;

        Ok(config_dir.join("config.toml"))
    }

    fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
        if !path.exists() {
            return Ok(EngineConfig::default());
        }

        let config_content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&config_content)?;

        Ok(config)
    }

    fn save_config(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let config_content = toml::to_string_pretty(&self.config)?;
        std::fs::write(&self.config_path, config_content)?;

        Ok(())
    }
}
