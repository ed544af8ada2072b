//! Training state as a lifecycle-managed engine
//!
//! The lifecycle manager only knows [`SynthesisEngine`]s. Wrapping the
//! shared training backend lets the training model take a residency slot,
//! get evicted to host when released, and come back on the next acquire
//! with its tensors untouched.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::core::error::{ExecutionStage, Result, TtsError};
use crate::engine::{
    Footprint, Placement, QualityProfile, SynthesisEngine, SynthesisOutput, SynthesisRequest,
};
use super::backend::TrainingBackend;

/// Backend shared between the training loop and its residency
pub type SharedBackend = Arc<Mutex<Box<dyn TrainingBackend>>>;

pub fn shared_backend(backend: impl TrainingBackend + 'static) -> SharedBackend {
    Arc::new(Mutex::new(Box::new(backend)))
}

pub(crate) fn lock_backend<'a>(
    backend: &'a SharedBackend,
    location: &str,
) -> Result<MutexGuard<'a, Box<dyn TrainingBackend>>> {
    backend.lock().map_err(|_| TtsError::lock_poisoned(location))
}

pub struct TrainingResidency {
    id: String,
    backend: SharedBackend,
    placement: Placement,
}

impl TrainingResidency {
    /// Move every component of the backend to `placement`
    pub fn attach(id: impl Into<String>, backend: SharedBackend, placement: Placement) -> Result<Self> {
        let id = id.into();
        {
            let mut guard = lock_backend(&backend, "TrainingResidency::attach")?;
            for component in guard.components() {
                guard.relocate_component(&component, placement)?;
            }
            debug!("Training state {} attached on {}", id, placement);
        }
        Ok(Self {
            id,
            backend,
            placement,
        })
    }
}

#[async_trait]
impl SynthesisEngine for TrainingResidency {
    fn engine_id(&self) -> &str {
        &self.id
    }

    fn placement(&self) -> Placement {
        self.placement
    }

    // Training state has no root module of its own
    fn relocate_root(&mut self, target: Placement) -> Result<()> {
        self.placement = target;
        Ok(())
    }

    fn relocate_component(&mut self, component: &str, target: Placement) -> Result<()> {
        lock_backend(&self.backend, "TrainingResidency::relocate_component")?
            .relocate_component(component, target)
    }

    fn footprint(&self) -> Footprint {
        match self.backend.lock() {
            Ok(backend) => backend.footprint(),
            Err(_) => Footprint::default(),
        }
    }

    async fn synthesize(
        &self,
        _request: &SynthesisRequest,
        _profile: &QualityProfile,
    ) -> Result<SynthesisOutput> {
        Err(TtsError::Execution {
            engine_id: self.id.clone(),
            stage: ExecutionStage::Synthesis,
            message: "training state cannot synthesize".to_string(),
            recoverable: false,
        })
    }
}
