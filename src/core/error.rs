//! Structured error handling for voxhost
//!
//! One error enum covers the whole control plane. Variants map onto the
//! failure classes the orchestrator and training loop react to: client
//! errors never fall back, load and transient execution failures do, and
//! checkpoint corruption always aborts a resume.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias with TtsError
pub type Result<T> = std::result::Result<T, TtsError>;

/// A single failed load-strategy attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    /// Strategy name
    pub strategy: String,
    /// Failure detail
    pub message: String,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.message)
    }
}

fn join_attempts(attempts: &[StrategyFailure]) -> String {
    if attempts.is_empty() {
        return "no load strategies declared".to_string();
    }
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Main error type
#[derive(Error, Debug, Clone)]
pub enum TtsError {
    /// Requested engine id is not registered
    #[error("Unknown engine '{engine_id}'")]
    UnknownEngine { engine_id: String },

    /// Every load strategy of an engine failed
    #[error("Failed to load engine '{engine_id}': {}", join_attempts(.attempts))]
    EngineLoad {
        engine_id: String,
        attempts: Vec<StrategyFailure>,
    },

    /// Engine loaded but a synthesis or training step failed
    #[error("Execution error in '{engine_id}' ({stage}): {message}")]
    Execution {
        engine_id: String,
        stage: ExecutionStage,
        message: String,
        recoverable: bool,
    },

    /// Memory reclamation could not be verified
    #[error("Eviction of '{engine_id}' incomplete: {message}")]
    Eviction {
        engine_id: String,
        message: String,
        relocated: Vec<String>,
        failed: Vec<String>,
    },

    /// A checkpoint could not be read back
    #[error("Corrupt checkpoint {path:?}: {message}")]
    CheckpointCorrupt { path: PathBuf, message: String },

    /// Queuing or acquisition exceeded its deadline
    #[error("Operation timeout: {message} ({duration_ms}ms)")]
    Timeout { message: String, duration_ms: u64 },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// Internal/bug errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        location: Option<String>,
    },
}

/// Where an execution failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStage {
    Synthesis,
    TrainingStep,
    Relocation,
    Sampling,
}

impl fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStage::Synthesis => write!(f, "synthesis"),
            ExecutionStage::TrainingStep => write!(f, "training step"),
            ExecutionStage::Relocation => write!(f, "relocation"),
            ExecutionStage::Sampling => write!(f, "sampling"),
        }
    }
}

/// Short machine-readable error classification, persisted in job records
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownEngine,
    EngineLoad,
    Execution,
    Eviction,
    CheckpointCorrupt,
    Timeout,
    Config,
    Validation,
    Io,
    Internal,
}

impl TtsError {
    /// Whether the serving path may retry on the default engine
    pub fn is_recoverable(&self) -> bool {
        match self {
            TtsError::EngineLoad { .. } => true,
            TtsError::Execution { recoverable, .. } => *recoverable,
            _ => false,
        }
    }

    /// Client errors are rejected before a job exists
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TtsError::UnknownEngine { .. } | TtsError::Validation { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TtsError::UnknownEngine { .. } => ErrorKind::UnknownEngine,
            TtsError::EngineLoad { .. } => ErrorKind::EngineLoad,
            TtsError::Execution { .. } => ErrorKind::Execution,
            TtsError::Eviction { .. } => ErrorKind::Eviction,
            TtsError::CheckpointCorrupt { .. } => ErrorKind::CheckpointCorrupt,
            TtsError::Timeout { .. } => ErrorKind::Timeout,
            TtsError::Config { .. } => ErrorKind::Config,
            TtsError::Validation { .. } => ErrorKind::Validation,
            TtsError::Io { .. } => ErrorKind::Io,
            TtsError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub(crate) fn lock_poisoned(location: &str) -> Self {
        TtsError::Internal {
            message: "lock poisoned".to_string(),
            location: Some(location.to_string()),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        TtsError::CheckpointCorrupt {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Add a simple message context
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| TtsError::Internal {
            message: format!("{}: {}", f(), e),
            location: None,
        })
    }

    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| TtsError::Internal {
            message: format!("{}: {}", msg.into(), e),
            location: None,
        })
    }
}

/// Convert from anyhow::Error
impl From<anyhow::Error> for TtsError {
    fn from(err: anyhow::Error) -> Self {
        TtsError::Internal {
            message: err.to_string(),
            location: None,
        }
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for TtsError {
    fn from(err: std::io::Error) -> Self {
        TtsError::Io {
            message: err.to_string(),
            path: None,
        }
    }
}

impl From<serde_json::Error> for TtsError {
    fn from(err: serde_json::Error) -> Self {
        TtsError::Internal {
            message: format!("JSON serialization failed: {}", err),
            location: None,
        }
    }
}

/// Convert from candle_core::Error
impl From<candle_core::Error> for TtsError {
    fn from(err: candle_core::Error) -> Self {
        TtsError::Internal {
            message: format!("Tensor operation failed: {}", err),
            location: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_load_lists_attempts() {
        let err = TtsError::EngineLoad {
            engine_id: "f5tts".to_string(),
            attempts: vec![
                StrategyFailure {
                    strategy: "custom-weights".to_string(),
                    message: "no path".to_string(),
                },
                StrategyFailure {
                    strategy: "pretrained".to_string(),
                    message: "missing model.safetensors".to_string(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("f5tts"));
        assert!(text.contains("custom-weights: no path"));
        assert!(text.contains("pretrained: missing"));
    }

    #[test]
    fn test_recoverability() {
        let load = TtsError::EngineLoad {
            engine_id: "x".to_string(),
            attempts: vec![],
        };
        assert!(load.is_recoverable());
        assert!(load.to_string().contains("no load strategies"));

        let fatal = TtsError::Execution {
            engine_id: "x".to_string(),
            stage: ExecutionStage::Synthesis,
            message: "bad input".to_string(),
            recoverable: false,
        };
        assert!(!fatal.is_recoverable());

        let unknown = TtsError::UnknownEngine {
            engine_id: "nope".to_string(),
        };
        assert!(!unknown.is_recoverable());
        assert!(unknown.is_client_error());
        assert_eq!(unknown.kind(), ErrorKind::UnknownEngine);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(ExecutionStage::TrainingStep.to_string(), "training step");
    }
}
