//! Synthesis jobs
//!
//! - `types`: requests and persisted job records
//! - `store`: [`JobStore`] with in-memory and file-backed implementations
//! - `orchestrator`: admission, execution and fallback

pub mod orchestrator;
pub mod store;
pub mod types;

pub use orchestrator::{JobOrchestrator, Submission};
pub use store::{open_store, FileJobStore, InMemoryJobStore, JobStore};
pub use types::{AudioSummary, Job, JobError, JobRequest, JobStatus};
