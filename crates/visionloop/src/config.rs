use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime tunables for capture, routing and persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum time to wait for a frame from a camera
    pub capture_timeout_ms: u64,
    /// Per-cycle deadline for every pipeline bound to a camera
    pub pipeline_deadline_ms: u64,
    /// Sleep between cycles for cameras with no bound pipelines
    pub idle_poll_ms: u64,
    /// First reconnect delay after a capture failure
    pub backoff_initial_ms: u64,
    /// Upper bound for the reconnect delay
    pub backoff_max_ms: u64,
    /// Consecutive failures after which reconnect probing stops
    pub max_consecutive_failures: u32,
    /// Recycled frame buffers kept per camera
    pub frame_pool_capacity: usize,
    /// Bundles buffered per output subscriber
    pub output_channel_capacity: usize,
    /// Directory holding the camera/pipeline document and its backup
    pub data_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            capture_timeout_ms: 500,
            pipeline_deadline_ms: 250,
            idle_poll_ms: 50,
            backoff_initial_ms: 100,
            backoff_max_ms: 5_000,
            max_consecutive_failures: 10,
            frame_pool_capacity: 4,
            output_channel_capacity: 16,
            data_dir: default_data_dir(),
        }
    }
}

/// Get the visionloop home directory
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".visionloop")
}

impl RuntimeConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::parse(&contents)
    }

    /// Load configuration from a file, or use defaults if the file doesn't exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("Config file not found, using defaults: {}", path.display());
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Parse configuration from a YAML string
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.capture_timeout_ms == 0 || self.pipeline_deadline_ms == 0 {
            return Err(ConfigError::ValidationError(
                "capture_timeout_ms and pipeline_deadline_ms must be non-zero".to_string(),
            ));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(ConfigError::ValidationError(format!(
                "backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        if self.output_channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "output_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn pipeline_deadline(&self) -> Duration {
        Duration::from_millis(self.pipeline_deadline_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Path of the persisted camera/pipeline document
    pub fn document_path(&self) -> PathBuf {
        self.data_dir.join("cameras.yaml")
    }

    /// Path of the pre-migration backup
    pub fn backup_path(&self) -> PathBuf {
        self.data_dir.join("cameras.yaml.bak")
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
