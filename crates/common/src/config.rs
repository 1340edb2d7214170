//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Pipeline sizing and timeouts.
    pub render: RenderDefaults,

    /// Encoder backend settings.
    pub encoder: EncoderDefaults,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Pipeline sizing used by render jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderDefaults {
    /// Worker threads for image sequence encoding. `None` means one less than
    /// the available processors.
    pub worker_threads: Option<usize>,

    /// Backlog permits per worker thread.
    pub backlog_factor: usize,

    /// Capacity of the materializer to encoder hand-off queue.
    pub container_queue_capacity: usize,

    /// How long to wait for a stopped materializer thread.
    pub materializer_join_timeout_ms: u64,

    /// Grace period given to an aborted worker pool.
    pub pool_grace_period_ms: u64,
}

/// Encoder backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderDefaults {
    /// ffmpeg executable used by the subprocess mux backend.
    pub ffmpeg_path: PathBuf,

    /// Rank platform hardware encoders ahead of software encoders.
    pub prefer_hardware_encoders: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "reelout=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for RenderDefaults {
    fn default() -> Self {
        Self {
            worker_threads: None,
            backlog_factor: 5,
            container_queue_capacity: 32,
            materializer_join_timeout_ms: 5_000,
            pool_grace_period_ms: 1_000,
        }
    }
}

impl Default for EncoderDefaults {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            prefer_hardware_encoders: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl RenderDefaults {
    /// Effective image sequence pool size, never less than one.
    pub fn pool_size(&self) -> usize {
        match self.worker_threads {
            Some(n) => n.max(1),
            None => std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1),
        }
    }
}

impl DeliveryConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(&config_file_path())
    }

    /// Load config from `path`, falling back to defaults.
    pub fn load_from(config_path: &std::path::Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        self.save_to(&config_file_path())
    }

    pub fn save_to(&self, config_path: &std::path::Path) -> Result<(), std::io::Error> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("reelout").join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pipeline_sizing() {
        let config = DeliveryConfig::default();
        assert_eq!(config.render.backlog_factor, 5);
        assert_eq!(config.render.container_queue_capacity, 32);
        assert!(config.render.pool_size() >= 1);
    }

    #[test]
    fn test_explicit_worker_threads_are_clamped() {
        let render = RenderDefaults {
            worker_threads: Some(0),
            ..RenderDefaults::default()
        };
        assert_eq!(render.pool_size(), 1);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: DeliveryConfig =
            serde_json::from_str(r#"{"render": {"backlog_factor": 2}}"#).unwrap();
        assert_eq!(config.render.backlog_factor, 2);
        assert_eq!(config.render.container_queue_capacity, 32);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load_roundtrip_through_file() {
        let path = std::env::temp_dir()
            .join(format!("reelout_test_config_{}", std::process::id()))
            .join("config.json");
        let mut config = DeliveryConfig::default();
        config.encoder.prefer_hardware_encoders = false;
        config.save_to(&path).unwrap();

        let loaded = DeliveryConfig::load_from(&path);
        assert!(!loaded.encoder.prefer_hardware_encoders);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let loaded = DeliveryConfig::load_from(std::path::Path::new("/nonexistent/reelout.json"));
        assert_eq!(loaded.render.pool_grace_period_ms, 1_000);
    }
}
