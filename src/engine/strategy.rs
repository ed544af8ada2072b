//! Load strategies
//!
//! A descriptor lists strategies in priority order; the lifecycle manager
//! tries each in turn and keeps every failure for the final
//! [`TtsError::EngineLoad`](crate::core::error::TtsError::EngineLoad).

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::error::{Result, TtsError};
use super::descriptor::EngineDescriptor;
use super::reference::ReferenceEngine;
use super::traits::{Placement, SynthesisEngine};

/// File name of pretrained weights under `<models_dir>/<family>/`
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Everything a strategy may consult
pub struct LoadContext<'a> {
    pub descriptor: &'a EngineDescriptor,
    /// Target placement for the loaded engine
    pub placement: Placement,
    pub models_dir: &'a Path,
}

impl LoadContext<'_> {
    /// Pretrained weights location for the descriptor's family
    pub fn pretrained_weights(&self) -> PathBuf {
        self.models_dir
            .join(&self.descriptor.family)
            .join(WEIGHTS_FILE)
    }
}

/// One way of materializing an engine
pub trait LoadStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Preflight used by health checks. Inspects files but must not load
    /// tensor data.
    fn check(&self, _ctx: &LoadContext<'_>) -> Result<()> {
        Ok(())
    }

    fn load(&self, ctx: &LoadContext<'_>) -> Result<Box<dyn SynthesisEngine>>;
}

impl fmt::Debug for dyn LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoadStrategy({})", self.name())
    }
}

fn unavailable(message: impl Into<String>) -> TtsError {
    TtsError::Io {
        message: message.into(),
        path: None,
    }
}

/// Safetensors caps its JSON header at 100 MB
const MAX_HEADER_BYTES: u64 = 100_000_000;

/// The file exists and its safetensors header is intact: the header parses
/// and every tensor's byte range lies inside the file. Tensor data is not
/// read.
fn require_weights(path: &Path) -> Result<()> {
    let broken = |message: String| TtsError::Io {
        message,
        path: Some(path.to_path_buf()),
    };
    if !path.is_file() {
        return Err(broken(format!("weights not found at {}", path.display())));
    }

    let mut file = File::open(path)
        .map_err(|e| broken(format!("cannot open {}: {}", path.display(), e)))?;
    let file_len = file
        .metadata()
        .map_err(|e| broken(format!("cannot stat {}: {}", path.display(), e)))?
        .len();

    let mut prefix = [0u8; 8];
    file.read_exact(&mut prefix)
        .map_err(|_| broken(format!("{} is too short for a safetensors header", path.display())))?;
    let header_len = u64::from_le_bytes(prefix);
    let data_len = file_len.saturating_sub(8);
    if header_len > data_len || header_len > MAX_HEADER_BYTES {
        return Err(broken(format!(
            "{}: header length {} exceeds file size {}",
            path.display(),
            header_len,
            file_len
        )));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)
        .map_err(|e| broken(format!("{}: unreadable header: {}", path.display(), e)))?;
    let entries: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&header)
        .map_err(|e| broken(format!("{}: malformed header: {}", path.display(), e)))?;

    let payload = data_len - header_len;
    for (name, entry) in entries.iter().filter(|(name, _)| name.as_str() != "__metadata__") {
        let end = entry
            .get("data_offsets")
            .and_then(|o| o.get(1))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| broken(format!("{}: tensor {} has no data offsets", path.display(), name)))?;
        if end > payload {
            return Err(broken(format!(
                "{}: tensor {} ends at byte {} of a {} byte payload (truncated?)",
                path.display(),
                name,
                end,
                payload
            )));
        }
    }
    Ok(())
}

/// Loads the descriptor's `custom_weights_path`
#[derive(Debug, Clone, Copy, Default)]
pub struct CustomWeightsStrategy;

impl LoadStrategy for CustomWeightsStrategy {
    fn name(&self) -> &str {
        "custom-weights"
    }

    fn check(&self, ctx: &LoadContext<'_>) -> Result<()> {
        match &ctx.descriptor.capabilities.custom_weights_path {
            Some(path) => require_weights(path),
            None => Err(unavailable("no custom weights configured")),
        }
    }

    fn load(&self, ctx: &LoadContext<'_>) -> Result<Box<dyn SynthesisEngine>> {
        self.check(ctx)?;
        let path = ctx
            .descriptor
            .capabilities
            .custom_weights_path
            .as_deref()
            .ok_or_else(|| unavailable("no custom weights configured"))?;
        debug!("Loading custom weights for {} from {}", ctx.descriptor.id, path.display());
        let engine = ReferenceEngine::from_safetensors(ctx.descriptor, path, ctx.placement)?;
        Ok(Box::new(engine))
    }
}

/// Loads `<models_dir>/<family>/model.safetensors`
#[derive(Debug, Clone, Copy, Default)]
pub struct PretrainedStrategy;

impl LoadStrategy for PretrainedStrategy {
    fn name(&self) -> &str {
        "pretrained"
    }

    fn check(&self, ctx: &LoadContext<'_>) -> Result<()> {
        require_weights(&ctx.pretrained_weights())
    }

    fn load(&self, ctx: &LoadContext<'_>) -> Result<Box<dyn SynthesisEngine>> {
        let path = ctx.pretrained_weights();
        require_weights(&path)?;
        let engine = ReferenceEngine::from_safetensors(ctx.descriptor, &path, ctx.placement)?;
        Ok(Box::new(engine))
    }
}

/// Deterministic random initialization, for development without weights
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomInitStrategy;

impl LoadStrategy for RandomInitStrategy {
    fn name(&self) -> &str {
        "random-init"
    }

    fn load(&self, ctx: &LoadContext<'_>) -> Result<Box<dyn SynthesisEngine>> {
        warn!(
            "No weights for {}. Using random initialization (output will be noise-like)",
            ctx.descriptor.id
        );
        let engine = ReferenceEngine::random_init(ctx.descriptor, ctx.placement)?;
        Ok(Box::new(engine))
    }
}

/// Factory function type for creating engines
pub type EngineFactory =
    Arc<dyn Fn(&LoadContext<'_>) -> Result<Box<dyn SynthesisEngine>> + Send + Sync>;

/// Strategy backed by an arbitrary closure
#[derive(Clone)]
pub struct FactoryStrategy {
    name: String,
    factory: EngineFactory,
}

impl FactoryStrategy {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&LoadContext<'_>) -> Result<Box<dyn SynthesisEngine>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
        }
    }
}

impl LoadStrategy for FactoryStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self, ctx: &LoadContext<'_>) -> Result<Box<dyn SynthesisEngine>> {
        (self.factory)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::descriptor::QualityProfile;

    fn descriptor(custom: Option<PathBuf>) -> EngineDescriptor {
        let mut builder = EngineDescriptor::builder("xtts")
            .components(["gpt", "vocoder"])
            .baseline(QualityProfile::new("balanced"))
            .strategy(CustomWeightsStrategy)
            .strategy(PretrainedStrategy);
        if let Some(path) = custom {
            builder = builder.custom_weights(path);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_custom_weights_check_requires_path() {
        let dir = tempfile::tempdir().unwrap();
        let d = descriptor(None);
        let ctx = LoadContext {
            descriptor: &d,
            placement: Placement::Host,
            models_dir: dir.path(),
        };
        assert!(CustomWeightsStrategy.check(&ctx).is_err());

        let d = descriptor(Some(dir.path().join("missing.safetensors")));
        let ctx = LoadContext {
            descriptor: &d,
            placement: Placement::Host,
            models_dir: dir.path(),
        };
        let err = CustomWeightsStrategy.check(&ctx).unwrap_err();
        assert!(err.to_string().contains("missing.safetensors"));
    }

    #[test]
    fn test_pretrained_round_trip_through_reference_weights() {
        let dir = tempfile::tempdir().unwrap();
        let d = descriptor(None);
        let ctx = LoadContext {
            descriptor: &d,
            placement: Placement::Host,
            models_dir: dir.path(),
        };
        assert!(PretrainedStrategy.check(&ctx).is_err());

        let seed = ReferenceEngine::random_init(&d, Placement::Host).unwrap();
        std::fs::create_dir_all(dir.path().join("xtts")).unwrap();
        seed.save_weights(ctx.pretrained_weights()).unwrap();

        assert!(PretrainedStrategy.check(&ctx).is_ok());
        let engine = PretrainedStrategy.load(&ctx).unwrap();
        assert_eq!(engine.engine_id(), "xtts");
        assert_eq!(engine.footprint(), seed.footprint());
    }

    #[test]
    fn test_factory_strategy_delegates() {
        let strategy = FactoryStrategy::new("fixture", |ctx| {
            Ok(Box::new(ReferenceEngine::random_init(ctx.descriptor, ctx.placement)?)
                as Box<dyn SynthesisEngine>)
        });
        let dir = tempfile::tempdir().unwrap();
        let d = descriptor(None);
        let ctx = LoadContext {
            descriptor: &d,
            placement: Placement::Host,
            models_dir: dir.path(),
        };
        assert_eq!(strategy.name(), "fixture");
        assert!(strategy.check(&ctx).is_ok());
        assert!(strategy.load(&ctx).is_ok());
    }

    #[test]
    fn test_pretrained_check_rejects_corrupt_weights() {
        let dir = tempfile::tempdir().unwrap();
        let d = descriptor(None);
        let ctx = LoadContext {
            descriptor: &d,
            placement: Placement::Host,
            models_dir: dir.path(),
        };
        let path = ctx.pretrained_weights();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        std::fs::write(&path, b"not a safetensors file at all").unwrap();
        let err = PretrainedStrategy.check(&ctx).unwrap_err();
        assert!(err.to_string().contains("header length"));

        let seed = ReferenceEngine::random_init(&d, Placement::Host).unwrap();
        seed.save_weights(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        let err = PretrainedStrategy.check(&ctx).unwrap_err();
        assert!(err.to_string().contains("truncated"));
        assert!(PretrainedStrategy.load(&ctx).is_err());
    }
}
