//! Training backend interface
//!
//! The checkpoint manager drives any model implementing [`TrainingBackend`];
//! the numerics of a training step stay behind it.

use std::collections::{BTreeMap, HashMap};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::engine::{Footprint, Placement};

/// Learning-rate scheduler state, persisted with every checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub learning_rate: f64,
    pub step: u64,
    #[serde(default)]
    pub extra: BTreeMap<String, f64>,
}

/// Full numerical state of a training run
#[derive(Debug, Clone)]
pub struct TrainingSnapshot {
    /// Model weights, keyed `<component>` or `<component>.<name>`
    pub weights: HashMap<String, Tensor>,
    /// Optimizer buffers, keyed like the weights they belong to
    pub optimizer: HashMap<String, Tensor>,
    pub scheduler: SchedulerState,
    pub global_step: u64,
}

impl TrainingSnapshot {
    /// Flattened host copies of every tensor, for exact comparison
    pub fn host_values(&self) -> Result<BTreeMap<String, Vec<f32>>> {
        let mut out = BTreeMap::new();
        for (prefix, map) in [("model", &self.weights), ("optim", &self.optimizer)] {
            for (name, tensor) in map {
                out.insert(
                    format!("{}.{}", prefix, name),
                    tensor.flatten_all()?.to_vec1::<f32>()?,
                );
            }
        }
        Ok(out)
    }
}

/// Position of one update within the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateContext {
    /// 1-based update sequence number
    pub update: u64,
    pub epoch: u64,
    /// 0-based index within the epoch
    pub step_in_epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateOutcome {
    pub loss: f64,
    pub global_step: u64,
}

pub trait TrainingBackend: Send {
    fn updates_per_epoch(&self) -> u64;

    /// Components that hold accelerator memory, relocated on eviction
    fn components(&self) -> Vec<String>;

    fn train_update(&mut self, ctx: &UpdateContext) -> Result<UpdateOutcome>;

    fn snapshot(&self) -> Result<TrainingSnapshot>;

    fn restore(&mut self, snapshot: TrainingSnapshot) -> Result<()>;

    fn placement(&self) -> Placement;

    fn relocate_component(&mut self, component: &str, target: Placement) -> Result<()>;

    fn footprint(&self) -> Footprint;
}
