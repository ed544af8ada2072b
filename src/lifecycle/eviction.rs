//! Eviction procedure
//!
//! Reclaiming accelerator memory from an engine is a fixed sequence:
//!
//! 1. relocate the root module to host memory
//! 2. relocate every component the descriptor declares
//! 3. synchronization barrier on the original device
//! 4. cleanup pass (engine scratch buffers, allocator caches)
//! 5. measure the footprint again and report what was freed
//!
//! A step failing does not stop the later ones; the report lists what moved
//! and what did not.

use std::time::Instant;

use candle_core::{DType, Tensor};
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::error::{Result, TtsError};
use crate::engine::{EngineDescriptor, Footprint, Placement, SynthesisEngine};

/// Label used for the root module in reports
pub const ROOT: &str = "<root>";
const BARRIER: &str = "<barrier>";
const RESIDUAL: &str = "<residual>";

/// Device-level hooks used during eviction
pub trait AcceleratorProbe: Send + Sync {
    /// Block until all queued work on `placement` has finished
    fn synchronize(&self, placement: Placement) -> Result<()>;

    /// Return cached allocator blocks to the device
    fn reclaim(&self, _placement: Placement) {}
}

/// Probe over candle devices.
///
/// Synchronizes by reading a scalar back to the host, which waits for the
/// device stream to drain.
#[derive(Debug, Default, Clone, Copy)]
pub struct CandleProbe;

impl AcceleratorProbe for CandleProbe {
    fn synchronize(&self, placement: Placement) -> Result<()> {
        if !placement.is_accelerator() {
            return Ok(());
        }
        let device = placement.device()?;
        Tensor::zeros((), DType::F32, &device)?.to_scalar::<f32>()?;
        Ok(())
    }
}

/// Before/after accounting for one eviction
#[derive(Debug, Clone, Serialize)]
pub struct EvictionReport {
    pub engine_id: String,
    /// False when the engine was not resident; nothing was done
    pub was_resident: bool,
    pub before: Footprint,
    pub after: Footprint,
    pub freed_bytes: u64,
    pub relocated: Vec<String>,
    /// (component, error) pairs
    pub failed: Vec<(String, String)>,
    pub duration_ms: u64,
}

impl EvictionReport {
    pub fn not_resident(engine_id: impl Into<String>) -> Self {
        Self {
            engine_id: engine_id.into(),
            was_resident: false,
            before: Footprint::default(),
            after: Footprint::default(),
            freed_bytes: 0,
            relocated: Vec::new(),
            failed: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// The error surfaced for an incomplete eviction
    pub fn to_error(&self) -> Option<TtsError> {
        if self.is_complete() {
            return None;
        }
        Some(TtsError::Eviction {
            engine_id: self.engine_id.clone(),
            message: self
                .failed
                .iter()
                .map(|(c, e)| format!("{}: {}", c, e))
                .collect::<Vec<_>>()
                .join("; "),
            relocated: self.relocated.clone(),
            failed: self.failed.iter().map(|(c, _)| c.clone()).collect(),
        })
    }
}

/// Run the eviction sequence against a loaded engine
pub(crate) fn evict_engine(
    descriptor: &EngineDescriptor,
    engine: &mut dyn SynthesisEngine,
    probe: &dyn AcceleratorProbe,
) -> EvictionReport {
    let start = Instant::now();
    let origin = engine.placement();
    let before = engine.footprint();
    let mut relocated = Vec::new();
    let mut failed = Vec::new();

    match engine.relocate_root(Placement::Host) {
        Ok(()) => relocated.push(ROOT.to_string()),
        Err(e) => {
            warn!("{}: root relocation failed: {}", descriptor.id, e);
            failed.push((ROOT.to_string(), e.to_string()));
        }
    }

    for component in &descriptor.components {
        match engine.relocate_component(component, Placement::Host) {
            Ok(()) => relocated.push(component.clone()),
            Err(e) => {
                warn!("{}: component {} stayed resident: {}", descriptor.id, component, e);
                failed.push((component.clone(), e.to_string()));
            }
        }
    }

    // Tensors moved off an accelerator placement are only gone once the
    // device has drained.
    let barrier_target = if origin.is_accelerator() {
        origin
    } else {
        Placement::Accelerator(0)
    };
    if before.accelerator_bytes > 0 || origin.is_accelerator() {
        if let Err(e) = probe.synchronize(barrier_target) {
            failed.push((BARRIER.to_string(), e.to_string()));
        }
    }

    engine.release_cached();
    probe.reclaim(barrier_target);

    let after = engine.footprint();
    if after.accelerator_bytes > 0 && failed.is_empty() {
        failed.push((
            RESIDUAL.to_string(),
            format!("{} bytes still on the accelerator", after.accelerator_bytes),
        ));
    }

    let report = EvictionReport {
        engine_id: descriptor.id.clone(),
        was_resident: true,
        before,
        after,
        freed_bytes: before.accelerator_bytes.saturating_sub(after.accelerator_bytes),
        relocated,
        failed,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    debug!(
        "Evicted {}: freed {} bytes in {}ms ({} relocated, {} failed)",
        report.engine_id,
        report.freed_bytes,
        report.duration_ms,
        report.relocated.len(),
        report.failed.len()
    );
    report
}
