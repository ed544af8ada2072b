//! # voxhost - TTS engine hosting control plane
//!
//! Runs several speech-synthesis engines on one accelerator and keeps them
//! from fighting over its memory.
//!
//! ## Features
//!
//! - **Lifecycle management**: ordered load strategies, leased access,
//!   guaranteed eviction of every declared component back to host memory
//! - **Job orchestration**: fair admission, one-hop fallback to the default
//!   engine with quality-profile translation, full provenance in the job record
//! - **Fine-tuning**: numbered and `latest` checkpoints, exact resume, audio
//!   previews rendered from checkpoint weights between updates
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use voxhost::{
//!     builtin_profile_map, register_builtin, EngineRegistry, InMemoryJobStore,
//!     JobOrchestrator, JobRequest, ModelLifecycleManager, ServiceConfig,
//! };
//!
//! let config = ServiceConfig::default();
//! let registry = Arc::new(EngineRegistry::new());
//! register_builtin(&registry, &config.lifecycle)?;
//!
//! let lifecycle = ModelLifecycleManager::new(registry, config.lifecycle.clone());
//! let orchestrator = JobOrchestrator::new(
//!     lifecycle,
//!     Arc::new(InMemoryJobStore::new()),
//!     builtin_profile_map(),
//!     config.orchestrator.clone(),
//! )?;
//!
//! let job = orchestrator
//!     .submit(JobRequest::new("Hello world", "f5tts").profile("ultra_natural"))
//!     .await?;
//! println!("{} served by {:?}", job.id, job.used_engine_id);
//! ```

pub mod core;
pub mod engine;
pub mod jobs;
pub mod lifecycle;
pub mod training;

pub use core::{
    ErrorKind, LifecycleConfig, MetricsCollector, OrchestratorConfig, Result, ServiceConfig,
    TrainingConfig, TtsError,
};
pub use engine::{
    builtin_profile_map, register_builtin, EngineDescriptor, EngineKind, EngineRegistry,
    Footprint, Placement, QualityProfile, QualityProfileMap, SynthesisEngine, SynthesisMode,
};
pub use jobs::{FileJobStore, InMemoryJobStore, Job, JobOrchestrator, JobRequest, JobStatus, JobStore};
pub use lifecycle::{EvictionReport, HealthReport, Lease, ModelLifecycleManager};
pub use training::{CheckpointManager, PreviewSpec, ReferenceTrainer, TrainingBackend};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
