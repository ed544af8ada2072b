//! Engine residency
//!
//! [`ModelLifecycleManager`] owns every loaded engine and hands out
//! [`Lease`]s; eviction reclaims accelerator memory component by component.

pub mod eviction;
pub mod handle;
pub mod manager;

pub use eviction::{AcceleratorProbe, CandleProbe, EvictionReport};
pub use handle::{HandleInfo, Lease};
pub use manager::{
    EngineHealth, EngineStatus, EvictionFailure, HealthReport, LifecycleBuilder,
    ModelLifecycleManager,
};
