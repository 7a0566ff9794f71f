//! Configuration for the breathing-session agent.

use crate::core::DetectorConfig;
use crate::source::SerialConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the session agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plateau detection parameters
    pub detector: DetectorConfig,

    /// Serial line the CO2 sensor is attached to
    pub serial: SerialConfig,

    /// Wall-clock ceiling for a single session
    #[serde(with = "duration_serde")]
    pub max_session_duration: Duration,

    /// Persist an in-progress checkpoint every N samples (0 disables)
    pub checkpoint_every_samples: usize,

    /// Tag identifying the acquisition rig
    pub origin: String,

    /// Nominal sensor sample rate in Hz
    pub sample_rate_hz: f64,

    /// Path for session documents and the ingestion log
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("breath-session-agent");

        Self {
            detector: DetectorConfig::default(),
            serial: SerialConfig::default(),
            max_session_duration: Duration::from_secs(600),
            checkpoint_every_samples: 5,
            origin: "scd30_bag_v1".to_string(),
            sample_rate_hz: 0.5, // SCD30 reports every 2 seconds
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit path, falling back to defaults
    /// when the file does not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("breath-session-agent")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        Ok(())
    }

    /// Reject parameter combinations the detector cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        if d.stability_threshold_ppm.is_nan() || d.stability_threshold_ppm < 0.0 {
            return Err(ConfigError::Invalid(
                "stability_threshold_ppm must be non-negative".to_string(),
            ));
        }
        if d.min_plateau_delta_ppm.is_nan() || d.min_plateau_delta_ppm < 0.0 {
            return Err(ConfigError::Invalid(
                "min_plateau_delta_ppm must be non-negative".to_string(),
            ));
        }
        if d.co2_min_ppm >= d.co2_max_ppm {
            return Err(ConfigError::Invalid(
                "co2_min_ppm must be below co2_max_ppm".to_string(),
            ));
        }
        if d.max_samples_without_plateau == 0 {
            return Err(ConfigError::Invalid(
                "max_samples_without_plateau must be at least 1".to_string(),
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be positive".to_string()));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(serde_json::Error),
    #[error("Serialize error: {0}")]
    Serialize(serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
