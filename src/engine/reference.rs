//! Tensor-backed reference engine
//!
//! Holds real candle tensors grouped into a root module plus the components
//! its descriptor declares, so relocation and footprint accounting operate
//! on actual device memory. Synthesis renders a tone whose pitch and level
//! follow the quality profile and the loaded weights.

use std::collections::{BTreeMap, HashMap};
use std::f32::consts::PI;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::core::error::{ExecutionStage, Result, TtsError};
use super::descriptor::{EngineDescriptor, QualityProfile};
use super::traits::{
    Footprint, Placement, SynthesisEngine, SynthesisMode, SynthesisOutput, SynthesisRequest,
};

/// Output sample rate
pub const SAMPLE_RATE: u32 = 22050;

const COMPONENT_ELEMENTS: usize = 4096;
const CACHE_ELEMENTS: usize = 1024;
const ROOT_TENSOR: &str = "embedding.weight";

fn tensor_bytes(t: &Tensor) -> u64 {
    (t.elem_count() * t.dtype().size_in_bytes()) as u64
}

/// A group of tensors sharing one placement
#[derive(Debug, Clone)]
struct Module {
    placement: Placement,
    tensors: BTreeMap<String, Tensor>,
}

impl Module {
    fn new(placement: Placement) -> Self {
        Self {
            placement,
            tensors: BTreeMap::new(),
        }
    }

    fn bytes(&self) -> u64 {
        self.tensors.values().map(tensor_bytes).sum()
    }

    fn footprint(&self) -> Footprint {
        Footprint::on(self.placement, self.bytes())
    }

    /// Moves every tensor or none
    fn relocate(&mut self, target: Placement) -> Result<()> {
        if self.placement == target {
            return Ok(());
        }
        let device = target.device()?;
        let mut moved = BTreeMap::new();
        for (name, tensor) in &self.tensors {
            moved.insert(name.clone(), tensor.to_device(&device)?);
        }
        self.tensors = moved;
        self.placement = target;
        Ok(())
    }
}

/// Reference synthesis engine over candle tensors
pub struct ReferenceEngine {
    id: String,
    root: Module,
    components: BTreeMap<String, Module>,
    /// Scratch buffers allocated at load; not owned by any module
    cache: Vec<Tensor>,
    cache_placement: Placement,
}

impl ReferenceEngine {
    /// Group named tensors into the descriptor's components.
    ///
    /// A tensor belongs to the component named by its first path segment;
    /// a `model.` prefix is stripped and `optim.` tensors are ignored.
    pub fn from_tensors(
        descriptor: &EngineDescriptor,
        tensors: HashMap<String, Tensor>,
        placement: Placement,
    ) -> Result<Self> {
        let mut root = Module::new(Placement::Host);
        let mut components: BTreeMap<String, Module> = descriptor
            .components
            .iter()
            .map(|c| (c.clone(), Module::new(Placement::Host)))
            .collect();

        let mut count = 0usize;
        for (name, tensor) in tensors {
            if name.starts_with("optim.") {
                continue;
            }
            let name = name.strip_prefix("model.").unwrap_or(&name).to_string();
            let head = name.split('.').next().unwrap_or(&name).to_string();
            let tensor = tensor.to_device(&Device::Cpu)?;
            match components.get_mut(&head) {
                Some(module) => module.tensors.insert(name, tensor),
                None => root.tensors.insert(name, tensor),
            };
            count += 1;
        }

        if count == 0 {
            return Err(TtsError::Validation {
                message: format!("weights for '{}' contain no model tensors", descriptor.id),
                field: Some("weights".to_string()),
            });
        }

        let mut engine = Self {
            id: descriptor.id.clone(),
            root,
            components,
            cache: Vec::new(),
            cache_placement: placement,
        };
        engine.place(placement)?;
        Ok(engine)
    }

    pub fn from_safetensors(
        descriptor: &EngineDescriptor,
        path: &Path,
        placement: Placement,
    ) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| {
            TtsError::Io {
                message: format!("Failed to read weights: {}", e),
                path: Some(path.to_path_buf()),
            }
        })?;
        debug!("Loaded {} tensors from {}", tensors.len(), path.display());
        Self::from_tensors(descriptor, tensors, placement)
    }

    /// Deterministic weights for every declared component
    pub fn random_init(descriptor: &EngineDescriptor, placement: Placement) -> Result<Self> {
        let mut tensors = HashMap::new();
        tensors.insert(ROOT_TENSOR.to_string(), seeded(0.0, COMPONENT_ELEMENTS)?);
        for (i, component) in descriptor.components.iter().enumerate() {
            tensors.insert(
                format!("{}.weight", component),
                seeded((i + 1) as f32, COMPONENT_ELEMENTS)?,
            );
        }
        Self::from_tensors(descriptor, tensors, placement)
    }

    /// Write all model tensors to a safetensors file
    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = HashMap::new();
        for module in std::iter::once(&self.root).chain(self.components.values()) {
            for (name, tensor) in &module.tensors {
                out.insert(name.clone(), tensor.to_device(&Device::Cpu)?);
            }
        }
        candle_core::safetensors::save(&out, path.as_ref())?;
        Ok(())
    }

    pub fn component_placement(&self, component: &str) -> Option<Placement> {
        self.components.get(component).map(|m| m.placement)
    }

    fn place(&mut self, placement: Placement) -> Result<()> {
        self.root.relocate(placement)?;
        for module in self.components.values_mut() {
            module.relocate(placement)?;
        }
        let device = placement.device()?;
        self.cache = vec![Tensor::zeros(CACHE_ELEMENTS, DType::F32, &device)?];
        self.cache_placement = placement;
        Ok(())
    }

    /// Mean absolute weight; distinguishes checkpoints in rendered audio
    fn weight_signature(&self) -> Result<f32> {
        let mut total = 0.0f32;
        let mut n = 0usize;
        for module in std::iter::once(&self.root).chain(self.components.values()) {
            for tensor in module.tensors.values() {
                total += tensor.abs()?.mean_all()?.to_scalar::<f32>()?;
                n += 1;
            }
        }
        Ok(if n == 0 { 0.0 } else { total / n as f32 })
    }
}

fn seeded(seed: f32, len: usize) -> Result<Tensor> {
    let values: Vec<f32> = (0..len)
        .map(|i| ((i as f32 + seed * 131.0) * 0.37).sin() * 0.02)
        .collect();
    Ok(Tensor::from_vec(values, len, &Device::Cpu)?)
}

#[async_trait]
impl SynthesisEngine for ReferenceEngine {
    fn engine_id(&self) -> &str {
        &self.id
    }

    fn placement(&self) -> Placement {
        self.root.placement
    }

    fn relocate_root(&mut self, target: Placement) -> Result<()> {
        self.root.relocate(target)
    }

    fn relocate_component(&mut self, component: &str, target: Placement) -> Result<()> {
        let module = self
            .components
            .get_mut(component)
            .ok_or_else(|| TtsError::Execution {
                engine_id: self.id.clone(),
                stage: ExecutionStage::Relocation,
                message: format!("no component named '{}'", component),
                recoverable: false,
            })?;
        module.relocate(target)
    }

    fn footprint(&self) -> Footprint {
        let cache: u64 = self.cache.iter().map(tensor_bytes).sum();
        self.components
            .values()
            .map(Module::footprint)
            .fold(self.root.footprint(), |acc, fp| acc + fp)
            + Footprint::on(self.cache_placement, cache)
    }

    fn release_cached(&mut self) {
        self.cache.clear();
    }

    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        profile: &QualityProfile,
    ) -> Result<SynthesisOutput> {
        let start = Instant::now();
        let text = request.text.trim();
        if text.is_empty() {
            return Err(TtsError::Execution {
                engine_id: self.id.clone(),
                stage: ExecutionStage::Synthesis,
                message: "nothing to synthesize".to_string(),
                recoverable: false,
            });
        }

        let signature = self.weight_signature()?;
        let seconds =
            (text.chars().count() as f32 * 0.06 / profile.speed.max(0.1)).clamp(0.25, 30.0);
        let num_samples = (seconds * SAMPLE_RATE as f32) as usize;
        let frequency = 110.0 + 80.0 * profile.temperature + 400.0 * signature.min(1.0);
        let amplitude = 0.2 + 0.3 * profile.top_p.clamp(0.0, 1.0);
        let fade = (SAMPLE_RATE / 100) as f32;

        let audio: Vec<f32> = (0..num_samples)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                let edge = (i as f32).min((num_samples - i) as f32);
                let envelope = (edge / fade).min(1.0);
                amplitude * envelope * (2.0 * PI * frequency * t).sin()
            })
            .collect();

        let mut output = SynthesisOutput::new(audio, SAMPLE_RATE);
        output.processing_time_ms = start.elapsed().as_millis() as u64;
        output.metadata.insert("engine".to_string(), self.id.clone());
        output.metadata.insert("profile".to_string(), profile.id.clone());
        output
            .metadata
            .insert("placement".to_string(), self.root.placement.to_string());
        if request.mode == SynthesisMode::Cloned {
            if let Some(voice) = &request.voice {
                output.metadata.insert("voice".to_string(), voice.clone());
            }
        }
        Ok(output)
    }
}
