//! Fine-tuning with checkpoint/resume and sample previews
//!
//! - `backend`: the [`TrainingBackend`] a run drives
//! - `checkpoint`: on-disk checkpoint layout, retention and resume lookup
//! - `residency`: lets the training model hold a lifecycle residency slot
//! - `manager`: the [`CheckpointManager`] run loop
//! - `reference`: deterministic momentum-SGD backend

pub mod backend;
pub mod checkpoint;
pub mod manager;
pub mod reference;
pub mod residency;

pub use backend::{SchedulerState, TrainingBackend, TrainingSnapshot, UpdateContext, UpdateOutcome};
pub use checkpoint::{
    CheckpointKind, CheckpointMeta, CheckpointPosition, CheckpointRecord, CheckpointStore,
};
pub use manager::{
    CheckpointManager, PreviewSpec, ProgressCallback, TrainingPhase, TrainingProgress,
    TrainingReport,
};
pub use reference::ReferenceTrainer;
pub use residency::{shared_backend, SharedBackend, TrainingResidency};
