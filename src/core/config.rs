//! Service configuration
//!
//! Loaded from a TOML file; every field has a default so a missing file or
//! a partial one is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Result, TtsError};
use crate::engine::Placement;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Residency settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Evict as soon as the last lease is released, one resident engine at most
    #[serde(default = "default_true")]
    pub constrained: bool,
    /// Warm engines kept when not constrained
    #[serde(default = "default_max_resident")]
    pub max_resident: usize,
    /// Place engines on the accelerator
    #[serde(default = "default_true")]
    pub use_accelerator: bool,
    /// Accelerator ordinal
    #[serde(default)]
    pub device_ordinal: usize,
    /// Root directory holding `<engine-id>/model.safetensors`
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    /// Allow engines to start from random initialization when no weights exist
    #[serde(default)]
    pub allow_random_init: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            constrained: true,
            max_resident: default_max_resident(),
            use_accelerator: true,
            device_ordinal: 0,
            models_dir: default_models_dir(),
            allow_random_init: false,
        }
    }
}

impl LifecycleConfig {
    pub fn placement(&self) -> Placement {
        if self.use_accelerator {
            Placement::Accelerator(self.device_ordinal)
        } else {
            Placement::Host
        }
    }

    /// Resident slots actually enforced
    pub fn resident_limit(&self) -> usize {
        if self.constrained {
            1
        } else {
            self.max_resident.max(1)
        }
    }
}

/// Job orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Engine substituted when the requested one is unusable
    #[serde(default = "default_engine")]
    pub default_engine: String,
    /// Deadline for queuing plus acquisition, in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Directory for durable job records; in-memory when unset
    #[serde(default)]
    pub job_store_dir: Option<PathBuf>,
    /// Directory receiving `<job-id>.wav` results
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_engine: default_engine(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            job_store_dir: None,
            output_dir: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Fine-tuning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    /// Numbered checkpoint cadence, in updates
    #[serde(default = "default_save_every")]
    pub save_every: u64,
    /// `latest` checkpoint cadence, in updates
    #[serde(default = "default_latest_every")]
    pub latest_every: u64,
    /// Numbered checkpoints retained
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
    /// Preview cadence, in updates; 0 disables previews
    #[serde(default = "default_save_every")]
    pub sample_every: u64,
    #[serde(default = "default_epochs")]
    pub epochs: u64,
    /// Inference engine rendering previews from checkpoint weights
    #[serde(default = "default_engine")]
    pub sample_engine: String,
    /// Profile used for previews; the sample engine's baseline when unset
    #[serde(default)]
    pub sample_profile: Option<String>,
    /// Engine id under which the training model holds its residency lease
    #[serde(default = "default_training_engine")]
    pub training_engine: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: default_checkpoint_dir(),
            save_every: default_save_every(),
            latest_every: default_latest_every(),
            keep_last: default_keep_last(),
            sample_every: default_save_every(),
            epochs: default_epochs(),
            sample_engine: default_engine(),
            sample_profile: None,
            training_engine: default_training_engine(),
        }
    }
}

impl TrainingConfig {
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    pub fn with_epochs(mut self, epochs: u64) -> Self {
        self.epochs = epochs;
        self
    }

    /// Numbered cadence, `latest` cadence and numbered retention
    pub fn with_cadence(mut self, save_every: u64, latest_every: u64, keep_last: usize) -> Self {
        self.save_every = save_every;
        self.latest_every = latest_every;
        self.keep_last = keep_last;
        self
    }

    pub fn with_sampling(mut self, sample_every: u64, engine: impl Into<String>) -> Self {
        self.sample_every = sample_every;
        self.sample_engine = engine.into();
        self
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_resident() -> usize {
    2
}

fn default_models_dir() -> PathBuf {
    dirs::home_dir()
        .map(|p| p.join(".cache").join("voxhost").join("models"))
        .unwrap_or_else(|| PathBuf::from("models"))
}

fn default_engine() -> String {
    "xtts".to_string()
}

fn default_training_engine() -> String {
    "trainer".to_string()
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_save_every() -> u64 {
    100
}

fn default_latest_every() -> u64 {
    20
}

fn default_keep_last() -> usize {
    3
}

fn default_epochs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServiceConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| TtsError::Io {
            message: format!("Failed to read config file: {}", e),
            path: Some(path.to_path_buf()),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| TtsError::Config {
            message: format!("Failed to parse config file: {}", e),
            path: Some(path.to_path_buf()),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| TtsError::Config {
            message: format!("Failed to serialize config: {}", e),
            path: None,
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| TtsError::Io {
            message: format!("Failed to write config file: {}", e),
            path: Some(path.as_ref().to_path_buf()),
        })?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        if t.save_every == 0 {
            return Err(invalid("training.save_every", "must be at least 1"));
        }
        if t.latest_every == 0 {
            return Err(invalid("training.latest_every", "must be at least 1"));
        }
        if t.keep_last == 0 {
            return Err(invalid("training.keep_last", "must retain at least one checkpoint"));
        }
        if self.orchestrator.default_engine.is_empty() {
            return Err(invalid("orchestrator.default_engine", "must not be empty"));
        }
        if self.lifecycle.max_resident == 0 {
            return Err(invalid("lifecycle.max_resident", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> TtsError {
    TtsError::Config {
        message: format!("{} {}", field, message),
        path: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ServiceConfig = toml::from_str(
            r#"
            [lifecycle]
            constrained = false
            max_resident = 3

            [training]
            keep_last = 5
            "#,
        )
        .unwrap();

        assert!(!config.lifecycle.constrained);
        assert_eq!(config.lifecycle.resident_limit(), 3);
        assert_eq!(config.training.keep_last, 5);
        assert_eq!(config.training.save_every, 100);
        assert_eq!(config.orchestrator.default_engine, "xtts");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_constrained_forces_single_slot() {
        let config = LifecycleConfig {
            max_resident: 4,
            ..Default::default()
        };
        assert_eq!(config.resident_limit(), 1);
        assert_eq!(config.placement(), Placement::Accelerator(0));
    }

    #[test]
    fn test_validate_rejects_zero_retention() {
        let mut config = ServiceConfig::default();
        config.training.keep_last = 0;
        assert!(matches!(config.validate(), Err(TtsError::Config { .. })));
    }

    #[test]
    fn test_training_setters() {
        let config = TrainingConfig::default()
            .with_checkpoint_dir("/tmp/run")
            .with_epochs(2)
            .with_cadence(10, 5, 4)
            .with_sampling(0, "styletts2");
        assert_eq!(config.checkpoint_dir, PathBuf::from("/tmp/run"));
        assert_eq!(config.epochs, 2);
        assert_eq!((config.save_every, config.latest_every, config.keep_last), (10, 5, 4));
        assert_eq!(config.sample_every, 0);
        assert_eq!(config.sample_engine, "styletts2");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voxhost.toml");

        let mut config = ServiceConfig::default();
        config.orchestrator.acquire_timeout_ms = 1500;
        config.save(&path).unwrap();

        let loaded = ServiceConfig::load(&path).unwrap();
        assert_eq!(loaded.orchestrator.acquire_timeout(), Duration::from_millis(1500));
    }
}
