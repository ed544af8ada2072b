//! Core abstractions and framework-level components
//!
//! # Modules
//!
//! - `error`: Structured error handling with recoverability classification
//! - `metrics`: Counters, gauges and timers for the control plane
//! - `config`: TOML service configuration

pub mod config;
pub mod error;
pub mod metrics;

pub use config::{LifecycleConfig, LoggingConfig, OrchestratorConfig, ServiceConfig, TrainingConfig};
pub use error::{ErrorKind, ExecutionStage, Result, ResultExt, StrategyFailure, TtsError};
pub use metrics::{MetricsCollector, MetricsReport, TimerReport, TimerStats, TimingInfo};
