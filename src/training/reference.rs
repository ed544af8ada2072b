//! Deterministic reference trainer
//!
//! Momentum SGD pulling each component's weights toward a fixed target,
//! with an exponentially decaying learning rate. Small, exact and
//! reproducible, which is what checkpoint/resume needs to be checked against.

use std::collections::{BTreeMap, HashMap};

use candle_core::{Device, Tensor};

use crate::core::error::{ExecutionStage, Result, TtsError};
use crate::engine::{EngineDescriptor, Footprint, Placement};
use super::backend::{
    SchedulerState, TrainingBackend, TrainingSnapshot, UpdateContext, UpdateOutcome,
};

const DEFAULT_ELEMENTS: usize = 2048;

struct Slot {
    weight: Tensor,
    velocity: Tensor,
    target: Tensor,
    placement: Placement,
}

impl Slot {
    fn bytes(&self) -> u64 {
        [&self.weight, &self.velocity, &self.target]
            .iter()
            .map(|t| (t.elem_count() * t.dtype().size_in_bytes()) as u64)
            .sum()
    }
}

pub struct ReferenceTrainer {
    slots: BTreeMap<String, Slot>,
    scheduler: SchedulerState,
    base_lr: f64,
    momentum: f64,
    decay: f64,
    updates_per_epoch: u64,
    global_step: u64,
    placement: Placement,
}

fn pattern(len: usize, seed: usize, scale: f32, phase: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i + seed * 97) as f32 * phase).sin() * scale)
        .collect()
}

impl ReferenceTrainer {
    pub fn new(
        components: &[String],
        elements: usize,
        updates_per_epoch: u64,
        placement: Placement,
    ) -> Result<Self> {
        if components.is_empty() {
            return Err(TtsError::Validation {
                message: "trainer needs at least one component".to_string(),
                field: Some("components".to_string()),
            });
        }
        let device = placement.device()?;
        let mut slots = BTreeMap::new();
        for (i, name) in components.iter().enumerate() {
            slots.insert(
                name.clone(),
                Slot {
                    weight: Tensor::from_vec(pattern(elements, i, 0.5, 0.37), elements, &device)?,
                    velocity: Tensor::zeros(elements, candle_core::DType::F32, &device)?,
                    target: Tensor::from_vec(pattern(elements, i, 0.25, 0.11), elements, &device)?,
                    placement,
                },
            );
        }

        let base_lr = 0.05;
        Ok(Self {
            slots,
            scheduler: SchedulerState {
                learning_rate: base_lr,
                step: 0,
                extra: BTreeMap::new(),
            },
            base_lr,
            momentum: 0.9,
            decay: 0.995,
            updates_per_epoch,
            global_step: 0,
            placement,
        })
    }

    /// Trainer whose components match an inference engine's, so its
    /// checkpoints load into that engine
    pub fn for_descriptor(
        descriptor: &EngineDescriptor,
        updates_per_epoch: u64,
        placement: Placement,
    ) -> Result<Self> {
        Self::new(&descriptor.components, DEFAULT_ELEMENTS, updates_per_epoch, placement)
    }

    fn step_error(&self, message: impl Into<String>) -> TtsError {
        TtsError::Execution {
            engine_id: "reference-trainer".to_string(),
            stage: ExecutionStage::TrainingStep,
            message: message.into(),
            recoverable: false,
        }
    }
}

impl TrainingBackend for ReferenceTrainer {
    fn updates_per_epoch(&self) -> u64 {
        self.updates_per_epoch
    }

    fn components(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    fn train_update(&mut self, _ctx: &UpdateContext) -> Result<UpdateOutcome> {
        // Derived from the step count so a resumed run reproduces it exactly
        let lr = self.base_lr * self.decay.powf(self.scheduler.step as f64);
        let mut loss = 0.0f64;

        for slot in self.slots.values_mut() {
            let grad = slot.weight.sub(&slot.target)?;
            let velocity = slot.velocity.affine(self.momentum, 0.0)?.add(&grad)?;
            let weight = slot.weight.sub(&velocity.affine(lr, 0.0)?)?;
            loss += grad.sqr()?.mean_all()?.to_scalar::<f32>()? as f64;
            slot.weight = weight;
            slot.velocity = velocity;
        }

        let loss = loss / self.slots.len() as f64;
        if !loss.is_finite() {
            return Err(self.step_error("loss diverged"));
        }

        self.global_step += 1;
        self.scheduler.step += 1;
        self.scheduler.learning_rate = self.base_lr * self.decay.powf(self.scheduler.step as f64);
        Ok(UpdateOutcome {
            loss,
            global_step: self.global_step,
        })
    }

    fn snapshot(&self) -> Result<TrainingSnapshot> {
        let mut weights = HashMap::new();
        let mut optimizer = HashMap::new();
        for (name, slot) in &self.slots {
            weights.insert(name.clone(), slot.weight.clone());
            optimizer.insert(name.clone(), slot.velocity.clone());
        }
        Ok(TrainingSnapshot {
            weights,
            optimizer,
            scheduler: self.scheduler.clone(),
            global_step: self.global_step,
        })
    }

    fn restore(&mut self, mut snapshot: TrainingSnapshot) -> Result<()> {
        let mut restored = Vec::new();
        for (name, slot) in &self.slots {
            let weight = snapshot.weights.remove(name);
            let velocity = snapshot.optimizer.remove(name);
            let (Some(weight), Some(velocity)) = (weight, velocity) else {
                return Err(TtsError::Validation {
                    message: format!("snapshot has no state for component '{}'", name),
                    field: Some(name.clone()),
                });
            };
            if weight.dims() != slot.weight.dims() || velocity.dims() != slot.velocity.dims() {
                return Err(TtsError::Validation {
                    message: format!(
                        "component '{}' has shape {:?}, snapshot has {:?}",
                        name,
                        slot.weight.dims(),
                        weight.dims()
                    ),
                    field: Some(name.clone()),
                });
            }
            let device = slot.placement.device()?;
            restored.push((name.clone(), weight.to_device(&device)?, velocity.to_device(&device)?));
        }

        for (name, weight, velocity) in restored {
            if let Some(slot) = self.slots.get_mut(&name) {
                slot.weight = weight;
                slot.velocity = velocity;
            }
        }
        self.scheduler = snapshot.scheduler;
        self.global_step = snapshot.global_step;
        Ok(())
    }

    fn placement(&self) -> Placement {
        self.placement
    }

    fn relocate_component(&mut self, component: &str, target: Placement) -> Result<()> {
        let slot = self.slots.get_mut(component).ok_or_else(|| TtsError::Execution {
            engine_id: "reference-trainer".to_string(),
            stage: ExecutionStage::Relocation,
            message: format!("no component named '{}'", component),
            recoverable: false,
        })?;
        if slot.placement == target {
            return Ok(());
        }
        let device = target.device()?;
        let weight = slot.weight.to_device(&device)?;
        let velocity = slot.velocity.to_device(&device)?;
        let target_tensor = slot.target.to_device(&device)?;
        slot.weight = weight;
        slot.velocity = velocity;
        slot.target = target_tensor;
        slot.placement = target;
        self.placement = target;
        Ok(())
    }

    fn footprint(&self) -> Footprint {
        self.slots
            .values()
            .map(|s| Footprint::on(s.placement, s.bytes()))
            .fold(Footprint::default(), |acc, fp| acc + fp)
    }
}

/// Host copy of one tensor, for tests and diagnostics
pub fn host_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.to_device(&Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?)
}
