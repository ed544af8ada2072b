//! Built-in engine catalog
//!
//! Three engine families with their quality profiles and the fallback
//! profile table onto the default engine (`xtts`).

use crate::core::config::LifecycleConfig;
use crate::core::error::Result;
use super::descriptor::{EngineDescriptor, EngineDescriptorBuilder, QualityProfile};
use super::profiles::QualityProfileMap;
use super::registry::EngineRegistry;
use super::strategy::{CustomWeightsStrategy, PretrainedStrategy, RandomInitStrategy};

const MIB: u64 = 1024 * 1024;

fn with_strategies(builder: EngineDescriptorBuilder, config: &LifecycleConfig) -> EngineDescriptorBuilder {
    let builder = builder
        .strategy(CustomWeightsStrategy)
        .strategy(PretrainedStrategy);
    if config.allow_random_init {
        builder.strategy(RandomInitStrategy)
    } else {
        builder
    }
}

pub fn xtts(config: &LifecycleConfig) -> Result<EngineDescriptor> {
    with_strategies(EngineDescriptor::builder("xtts"), config)
        .name("XTTS v2")
        .languages([
            "en", "es", "fr", "de", "it", "pt", "pl", "tr", "ru", "nl", "cs", "ar", "zh", "ja",
            "hu", "ko",
        ])
        .supports_cloning(true)
        .components(["gpt", "hifigan_decoder", "speaker_encoder"])
        .baseline(QualityProfile::new("balanced").temperature(0.7).top_p(0.85).top_k(50))
        .profile(
            QualityProfile::new("expressive")
                .temperature(0.85)
                .top_p(0.9)
                .top_k(80)
                .repetition_penalty(2.0),
        )
        .profile(QualityProfile::new("fast").temperature(0.65).top_k(30).speed(1.15))
        .profile(
            QualityProfile::new("stable")
                .temperature(0.5)
                .top_p(0.75)
                .top_k(20)
                .repetition_penalty(5.0),
        )
        .footprint_hint(1800 * MIB)
        .build()
}

pub fn f5tts(config: &LifecycleConfig) -> Result<EngineDescriptor> {
    with_strategies(EngineDescriptor::builder("f5tts"), config)
        .name("F5-TTS")
        .languages(["en", "zh"])
        .supports_cloning(true)
        .components(["transformer", "vocos_vocoder", "text_embed"])
        .baseline(
            QualityProfile::new("balanced")
                .param("nfe_steps", 32.0)
                .param("cfg_strength", 2.0),
        )
        .profile(
            QualityProfile::new("ultra_natural")
                .temperature(0.8)
                .param("nfe_steps", 64.0)
                .param("cfg_strength", 2.0)
                .param("sway_sampling", -1.0),
        )
        .profile(
            QualityProfile::new("fast")
                .speed(1.1)
                .param("nfe_steps", 16.0)
                .param("cfg_strength", 1.5),
        )
        .footprint_hint(1400 * MIB)
        .build()
}

pub fn styletts2(config: &LifecycleConfig) -> Result<EngineDescriptor> {
    with_strategies(EngineDescriptor::builder("styletts2"), config)
        .name("StyleTTS 2")
        .languages(["en"])
        .supports_cloning(false)
        .components(["text_encoder", "style_encoder", "decoder", "diffusion"])
        .baseline(
            QualityProfile::new("balanced")
                .param("alpha", 0.3)
                .param("beta", 0.7)
                .param("diffusion_steps", 5.0),
        )
        .profile(
            QualityProfile::new("expressive")
                .temperature(0.9)
                .param("alpha", 0.5)
                .param("beta", 0.9)
                .param("diffusion_steps", 10.0)
                .param("embedding_scale", 1.5),
        )
        .footprint_hint(700 * MIB)
        .build()
}

/// Register every built-in engine
pub fn register_builtin(registry: &EngineRegistry, config: &LifecycleConfig) -> Result<()> {
    registry.register(xtts(config)?)?;
    registry.register(f5tts(config)?)?;
    registry.register(styletts2(config)?)?;
    Ok(())
}

/// Fallback translations onto `xtts`
pub fn builtin_profile_map() -> QualityProfileMap {
    let mut map = QualityProfileMap::new();
    map.insert("f5tts", "ultra_natural", "xtts", "expressive")
        .insert("f5tts", "balanced", "xtts", "balanced")
        .insert("f5tts", "fast", "xtts", "fast")
        .insert("styletts2", "balanced", "xtts", "balanced")
        .insert("styletts2", "expressive", "xtts", "expressive");
    map
}
