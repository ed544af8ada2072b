//! Engine Abstraction Layer
//!
//! Descriptors, load strategies and the [`SynthesisEngine`] trait every
//! loaded engine implements.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Engine Registry                          │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐     │
//! │  │   XTTS   │ │  F5-TTS  │ │StyleTTS 2│ │ Training │     │
//! │  │(default) │ │          │ │          │ │  models  │     │
//! │  └──────────┘ └──────────┘ └──────────┘ └──────────┘     │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  EngineDescriptor                           │
//! │  capabilities · components · load strategies · profiles    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  Load Strategies (ordered)                  │
//! │  custom-weights → pretrained → random-init / factory       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  SynthesisEngine Trait                      │
//! │  - synthesize()         - footprint()                      │
//! │  - relocate_root()      - relocate_component()             │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod builtin;
pub mod descriptor;
pub mod profiles;
pub mod reference;
pub mod registry;
pub mod strategy;
pub mod traits;

pub use builtin::{builtin_profile_map, register_builtin};
pub use descriptor::{
    EngineCapabilities, EngineDescriptor, EngineDescriptorBuilder, EngineKind, QualityProfile,
};
pub use profiles::{ProfileGap, ProfileMapping, QualityProfileMap, ResolvedProfile};
pub use reference::ReferenceEngine;
pub use registry::EngineRegistry;
pub use strategy::{
    CustomWeightsStrategy, EngineFactory, FactoryStrategy, LoadContext, LoadStrategy,
    PretrainedStrategy, RandomInitStrategy,
};
pub use traits::{
    Footprint, Placement, SynthesisEngine, SynthesisMode, SynthesisOutput, SynthesisRequest,
};
