//! Engine descriptors and quality profiles
//!
//! A descriptor is the immutable catalog entry for one engine: what it can
//! do, which sub-components it owns, how to load it, and which quality
//! profiles it offers. Descriptors derived from another one (for example to
//! point at a training checkpoint's weights) are new values.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::error::{Result, TtsError};
use super::strategy::{CustomWeightsStrategy, LoadStrategy};

/// Named bundle of synthesis parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityProfile {
    pub id: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Top-p (nucleus) sampling
    pub top_p: f32,
    /// Top-k sampling
    pub top_k: usize,
    pub repetition_penalty: f32,
    /// Speed multiplier
    pub speed: f32,
    /// Engine-specific numeric parameters
    #[serde(default)]
    pub extra: BTreeMap<String, f32>,
}

impl QualityProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            temperature: 0.7,
            top_p: 0.85,
            top_k: 50,
            repetition_penalty: 1.0,
            speed: 1.0,
            extra: BTreeMap::new(),
        }
    }

    pub fn temperature(mut self, value: f32) -> Self {
        self.temperature = value;
        self
    }

    pub fn top_p(mut self, value: f32) -> Self {
        self.top_p = value;
        self
    }

    pub fn top_k(mut self, value: usize) -> Self {
        self.top_k = value;
        self
    }

    pub fn repetition_penalty(mut self, value: f32) -> Self {
        self.repetition_penalty = value;
        self
    }

    pub fn speed(mut self, value: f32) -> Self {
        self.speed = value;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: f32) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Whether an engine serves synthesis or only holds a training model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Inference,
    Training,
}

/// Engine capabilities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineCapabilities {
    /// ISO 639-1 codes; empty means language-agnostic
    pub languages: Vec<String>,
    pub supports_cloning: bool,
    /// Fine-tuned weights to load instead of the pretrained ones
    pub custom_weights_path: Option<PathBuf>,
}

/// Immutable catalog entry for one engine
#[derive(Clone)]
pub struct EngineDescriptor {
    /// Unique engine identifier
    pub id: String,
    /// Engine this one derives from; equal to `id` for catalog entries
    pub family: String,
    pub name: String,
    pub kind: EngineKind,
    pub capabilities: EngineCapabilities,
    /// Owned sub-components relocated one by one on eviction
    pub components: Vec<String>,
    /// Tried in order until one succeeds
    pub load_strategies: Vec<Arc<dyn LoadStrategy>>,
    pub profiles: Vec<QualityProfile>,
    pub baseline_profile: Option<String>,
    /// Estimated accelerator bytes once loaded
    pub footprint_hint: u64,
}

impl fmt::Debug for EngineDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineDescriptor")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("kind", &self.kind)
            .field("components", &self.components)
            .field("load_strategies", &self.strategy_names())
            .field("profiles", &self.profile_ids())
            .field("baseline_profile", &self.baseline_profile)
            .finish()
    }
}

impl EngineDescriptor {
    pub fn builder(id: impl Into<String>) -> EngineDescriptorBuilder {
        EngineDescriptorBuilder::new(id)
    }

    pub fn profile(&self, id: &str) -> Option<&QualityProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn baseline(&self) -> Option<&QualityProfile> {
        self.baseline_profile
            .as_deref()
            .and_then(|id| self.profile(id))
    }

    pub fn profile_ids(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.id.as_str()).collect()
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.load_strategies.iter().map(|s| s.name()).collect()
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.capabilities.languages.is_empty()
            || self
                .capabilities
                .languages
                .iter()
                .any(|l| l.eq_ignore_ascii_case(language))
    }

    /// Same engine, loaded only from the given weights file
    pub fn derive_with_weights(&self, id: impl Into<String>, weights: impl AsRef<Path>) -> Self {
        let mut derived = self.clone();
        derived.id = id.into();
        derived.capabilities.custom_weights_path = Some(weights.as_ref().to_path_buf());
        derived.load_strategies = vec![Arc::new(CustomWeightsStrategy)];
        derived
    }
}

/// Builder for [`EngineDescriptor`]
pub struct EngineDescriptorBuilder {
    descriptor: EngineDescriptor,
}

impl EngineDescriptorBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            descriptor: EngineDescriptor {
                name: id.clone(),
                family: id.clone(),
                id,
                kind: EngineKind::Inference,
                capabilities: EngineCapabilities::default(),
                components: Vec::new(),
                load_strategies: Vec::new(),
                profiles: Vec::new(),
                baseline_profile: None,
                footprint_hint: 0,
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.descriptor.name = name.into();
        self
    }

    pub fn kind(mut self, kind: EngineKind) -> Self {
        self.descriptor.kind = kind;
        self
    }

    pub fn languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.capabilities.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn supports_cloning(mut self, enable: bool) -> Self {
        self.descriptor.capabilities.supports_cloning = enable;
        self
    }

    pub fn custom_weights(mut self, path: impl Into<PathBuf>) -> Self {
        self.descriptor.capabilities.custom_weights_path = Some(path.into());
        self
    }

    pub fn component(mut self, name: impl Into<String>) -> Self {
        self.descriptor.components.push(name.into());
        self
    }

    pub fn components<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor
            .components
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn strategy(mut self, strategy: impl LoadStrategy + 'static) -> Self {
        self.descriptor.load_strategies.push(Arc::new(strategy));
        self
    }

    pub fn shared_strategy(mut self, strategy: Arc<dyn LoadStrategy>) -> Self {
        self.descriptor.load_strategies.push(strategy);
        self
    }

    pub fn profile(mut self, profile: QualityProfile) -> Self {
        self.descriptor.profiles.push(profile);
        self
    }

    /// Add a profile and mark it as the baseline
    pub fn baseline(mut self, profile: QualityProfile) -> Self {
        self.descriptor.baseline_profile = Some(profile.id.clone());
        self.descriptor.profiles.push(profile);
        self
    }

    pub fn footprint_hint(mut self, bytes: u64) -> Self {
        self.descriptor.footprint_hint = bytes;
        self
    }

    pub fn build(self) -> Result<EngineDescriptor> {
        let d = self.descriptor;
        if d.id.is_empty() {
            return Err(TtsError::Config {
                message: "engine id must not be empty".to_string(),
                path: None,
            });
        }

        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = d.profiles.iter().find(|p| !seen.insert(p.id.as_str())) {
            return Err(TtsError::Config {
                message: format!("engine '{}' declares profile '{}' twice", d.id, dup.id),
                path: None,
            });
        }

        if d.kind == EngineKind::Inference && d.baseline().is_none() {
            return Err(TtsError::Config {
                message: format!("inference engine '{}' has no baseline profile", d.id),
                path: None,
            });
        }

        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EngineDescriptor {
        EngineDescriptor::builder("xtts")
            .languages(["en", "de"])
            .supports_cloning(true)
            .components(["gpt", "vocoder"])
            .baseline(QualityProfile::new("balanced"))
            .profile(QualityProfile::new("expressive").temperature(0.85))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_and_lookup() {
        let d = sample();
        assert_eq!(d.baseline().unwrap().id, "balanced");
        assert_eq!(d.profile("expressive").unwrap().temperature, 0.85);
        assert!(d.profile("missing").is_none());
        assert!(d.supports_language("EN"));
        assert!(!d.supports_language("ja"));
        assert_eq!(d.profile_ids(), vec!["balanced", "expressive"]);
    }

    #[test]
    fn test_inference_engine_requires_baseline() {
        let err = EngineDescriptor::builder("bare").build().unwrap_err();
        assert!(matches!(err, TtsError::Config { .. }));

        let training = EngineDescriptor::builder("trainer")
            .kind(EngineKind::Training)
            .build();
        assert!(training.is_ok());
    }

    #[test]
    fn test_duplicate_profiles_rejected() {
        let err = EngineDescriptor::builder("x")
            .baseline(QualityProfile::new("a"))
            .profile(QualityProfile::new("a"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn test_derive_with_weights() {
        let d = sample();
        let derived = d.derive_with_weights("xtts@00000010", "/tmp/ckpt.safetensors");
        assert_eq!(derived.id, "xtts@00000010");
        assert_eq!(derived.family, "xtts");
        assert_eq!(derived.components, d.components);
        assert_eq!(derived.strategy_names(), vec!["custom-weights"]);
        assert_eq!(
            derived.capabilities.custom_weights_path.as_deref(),
            Some(Path::new("/tmp/ckpt.safetensors"))
        );
    }
}
