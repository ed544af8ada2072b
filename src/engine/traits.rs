//! Core traits for engine abstraction
//!
//! Every synthesis backend is driven through [`SynthesisEngine`]. Besides
//! synthesis, the trait exposes the relocation surface the lifecycle manager
//! needs for eviction: the root module and each component the engine's
//! descriptor declares can be moved between the accelerator and host memory
//! independently, and the engine reports where its bytes currently live.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::core::error::{Result, TtsError};
use super::descriptor::QualityProfile;

/// Where an engine or component currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Accelerator with the given ordinal
    Accelerator(usize),
    /// Host memory
    Host,
}

impl Placement {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Placement::Accelerator(_))
    }

    /// Tensor device backing this placement.
    ///
    /// Falls back to the CPU when no accelerator backend is compiled in; the
    /// placement tag still drives memory accounting.
    pub fn device(&self) -> Result<Device> {
        match self {
            Placement::Host => Ok(Device::Cpu),
            Placement::Accelerator(ordinal) => Ok(Device::cuda_if_available(*ordinal)?),
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Accelerator(ordinal) => write!(f, "accelerator:{}", ordinal),
            Placement::Host => write!(f, "host"),
        }
    }
}

/// Memory held by an engine, split by placement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footprint {
    pub accelerator_bytes: u64,
    pub host_bytes: u64,
}

impl Footprint {
    pub fn on(placement: Placement, bytes: u64) -> Self {
        if placement.is_accelerator() {
            Self {
                accelerator_bytes: bytes,
                host_bytes: 0,
            }
        } else {
            Self {
                accelerator_bytes: 0,
                host_bytes: bytes,
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.accelerator_bytes + self.host_bytes
    }
}

impl std::ops::Add for Footprint {
    type Output = Footprint;

    fn add(self, rhs: Footprint) -> Footprint {
        Footprint {
            accelerator_bytes: self.accelerator_bytes + rhs.accelerator_bytes,
            host_bytes: self.host_bytes + rhs.host_bytes,
        }
    }
}

/// Synthesis mode requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMode {
    /// Built-in or default voice
    #[default]
    Direct,
    /// Voice cloned from a reference
    Cloned,
}

/// Engine-level synthesis request
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    /// Text to synthesize
    pub text: String,
    /// Voice or reference identifier
    pub voice: Option<String>,
    /// ISO 639-1 language code
    pub language: Option<String>,
    pub mode: SynthesisMode,
    /// Request ID for tracking
    pub request_id: Option<String>,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
            language: None,
            mode: SynthesisMode::Direct,
            request_id: None,
        }
    }
}

/// Synthesis output
#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    /// Audio samples in [-1, 1]
    pub audio: Vec<f32>,
    pub sample_rate: u32,
    /// Audio duration in seconds
    pub duration: f32,
    pub processing_time_ms: u64,
    /// Engine-specific metadata
    pub metadata: HashMap<String, String>,
}

impl SynthesisOutput {
    pub fn new(audio: Vec<f32>, sample_rate: u32) -> Self {
        let duration = if sample_rate == 0 {
            0.0
        } else {
            audio.len() as f32 / sample_rate as f32
        };
        Self {
            audio,
            sample_rate,
            duration,
            processing_time_ms: 0,
            metadata: HashMap::new(),
        }
    }

    /// Write 16-bit PCM WAV
    pub fn save_wav(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let io_err = |e: hound::Error| TtsError::Io {
            message: format!("Failed to write WAV: {}", e),
            path: Some(path.to_path_buf()),
        };

        let mut writer = hound::WavWriter::create(path, spec).map_err(io_err)?;
        for &sample in &self.audio {
            let sample_i16 = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
            writer.write_sample(sample_i16).map_err(io_err)?;
        }
        writer.finalize().map_err(io_err)?;
        Ok(())
    }
}

/// Core trait for all synthesis engines
#[async_trait]
pub trait SynthesisEngine: Send + Sync {
    /// Identifier of the descriptor this instance was loaded from
    fn engine_id(&self) -> &str;

    /// Placement of the root module
    fn placement(&self) -> Placement;

    /// Move the root module, i.e. everything not owned by a declared component
    fn relocate_root(&mut self, target: Placement) -> Result<()>;

    /// Move one declared component
    fn relocate_component(&mut self, component: &str, target: Placement) -> Result<()>;

    /// Current memory held, by placement
    fn footprint(&self) -> Footprint;

    /// Drop caches and scratch buffers held outside the components
    fn release_cached(&mut self) {}

    /// Synthesize speech with the given quality profile
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        profile: &QualityProfile,
    ) -> Result<SynthesisOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footprint_on_placement() {
        let fp = Footprint::on(Placement::Accelerator(0), 64) + Footprint::on(Placement::Host, 8);
        assert_eq!(fp.accelerator_bytes, 64);
        assert_eq!(fp.host_bytes, 8);
        assert_eq!(fp.total(), 72);
    }

    #[test]
    fn test_placement_display() {
        assert_eq!(Placement::Accelerator(1).to_string(), "accelerator:1");
        assert_eq!(Placement::Host.to_string(), "host");
        assert!(matches!(Placement::Host.device().unwrap(), Device::Cpu));
    }

    #[test]
    fn test_output_duration_and_wav() {
        let output = SynthesisOutput::new(vec![0.0; 22050], 22050);
        assert!((output.duration - 1.0).abs() < 1e-6);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        output.save_wav(&path).unwrap();
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 22050);
        assert_eq!(reader.len(), 22050);
    }
}
