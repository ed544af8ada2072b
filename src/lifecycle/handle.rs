//! Model handles and leases
//!
//! A [`ModelHandle`] never leaves the lifecycle manager. Callers receive a
//! [`Lease`], which grants use of the engine until it is released; dropping
//! a lease releases it.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::error::Result;
use crate::engine::{
    EngineDescriptor, Footprint, Placement, QualityProfile, SynthesisEngine, SynthesisOutput,
    SynthesisRequest,
};
use super::eviction::EvictionReport;
use super::manager::LifecycleInner;

pub(crate) type SharedEngine = Arc<RwLock<Box<dyn SynthesisEngine>>>;

/// One loaded engine instance
pub(crate) struct ModelHandle {
    pub descriptor: Arc<EngineDescriptor>,
    pub engine: SharedEngine,
    pub placement: Placement,
    /// Measured right after load
    pub footprint: Footprint,
    /// 0 means evictable
    pub leases: usize,
    pub loaded_at: DateTime<Utc>,
    pub last_used: Instant,
    /// Strategy that produced the engine
    pub strategy: String,
}

impl ModelHandle {
    pub fn new(
        descriptor: Arc<EngineDescriptor>,
        engine: Box<dyn SynthesisEngine>,
        strategy: String,
    ) -> Self {
        let placement = engine.placement();
        let footprint = engine.footprint();
        Self {
            descriptor,
            engine: Arc::new(RwLock::new(engine)),
            placement,
            footprint,
            leases: 0,
            loaded_at: Utc::now(),
            last_used: Instant::now(),
            strategy,
        }
    }

    pub fn info(&self) -> HandleInfo {
        HandleInfo {
            engine_id: self.descriptor.id.clone(),
            placement: self.placement,
            footprint: self.footprint,
            lease_count: self.leases,
            loaded_at: self.loaded_at,
            strategy: self.strategy.clone(),
            idle_ms: if self.leases == 0 {
                self.last_used.elapsed().as_millis() as u64
            } else {
                0
            },
        }
    }
}

/// Read-only snapshot of a resident engine
#[derive(Debug, Clone, Serialize)]
pub struct HandleInfo {
    pub engine_id: String,
    pub placement: Placement,
    pub footprint: Footprint,
    pub lease_count: usize,
    pub loaded_at: DateTime<Utc>,
    pub strategy: String,
    pub idle_ms: u64,
}

/// Permission to use a resident engine
pub struct Lease {
    id: u64,
    descriptor: Arc<EngineDescriptor>,
    placement: Placement,
    engine: SharedEngine,
    owner: Option<Arc<LifecycleInner>>,
}

impl Lease {
    pub(crate) fn new(id: u64, handle: &ModelHandle, owner: Arc<LifecycleInner>) -> Self {
        Self {
            id,
            descriptor: Arc::clone(&handle.descriptor),
            placement: handle.placement,
            engine: Arc::clone(&handle.engine),
            owner: Some(owner),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn engine_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &Arc<EngineDescriptor> {
        &self.descriptor
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub async fn synthesize(
        &self,
        request: &SynthesisRequest,
        profile: &QualityProfile,
    ) -> Result<SynthesisOutput> {
        let engine = self.engine.read().await;
        engine.synthesize(request, profile).await
    }

    pub async fn footprint(&self) -> Footprint {
        self.engine.read().await.footprint()
    }

    pub(crate) fn release(mut self) -> Option<EvictionReport> {
        self.owner
            .take()
            .and_then(|owner| owner.release_lease(&self.descriptor.id, self.id))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            debug!("Lease {} on {} dropped without release", self.id, self.descriptor.id);
            owner.release_lease(&self.descriptor.id, self.id);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("engine_id", &self.descriptor.id)
            .field("placement", &self.placement)
            .finish()
    }
}
