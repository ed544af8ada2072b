//! Cross-engine quality profile mapping
//!
//! When a job falls back to the default engine, the profile it asked for on
//! the original engine is translated through this table. Missing entries
//! resolve to the default engine's baseline profile; [`QualityProfileMap::audit`]
//! reports every such gap up front.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::error::Result;
use super::descriptor::EngineDescriptor;
use super::registry::EngineRegistry;

/// One (engine, profile) to (engine, profile) translation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileMapping {
    pub source_engine: String,
    pub source_profile: String,
    pub target_engine: String,
    pub target_profile: String,
}

/// Outcome of resolving a profile onto the default engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProfile {
    pub profile_id: String,
    /// False when the baseline was substituted
    pub mapped: bool,
}

/// A (engine, profile) pair with no usable mapping onto the default engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileGap {
    pub engine: String,
    pub profile: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct QualityProfileMap {
    entries: BTreeMap<(String, String), ProfileMapping>,
}

impl QualityProfileMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a mapping
    pub fn insert(
        &mut self,
        source_engine: impl Into<String>,
        source_profile: impl Into<String>,
        target_engine: impl Into<String>,
        target_profile: impl Into<String>,
    ) -> &mut Self {
        let mapping = ProfileMapping {
            source_engine: source_engine.into(),
            source_profile: source_profile.into(),
            target_engine: target_engine.into(),
            target_profile: target_profile.into(),
        };
        self.entries.insert(
            (mapping.source_engine.clone(), mapping.source_profile.clone()),
            mapping,
        );
        self
    }

    pub fn lookup(&self, engine: &str, profile: &str) -> Option<&ProfileMapping> {
        self.entries.get(&(engine.to_string(), profile.to_string()))
    }

    pub fn entries(&self) -> impl Iterator<Item = &ProfileMapping> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Profile to use on `default` for a job that asked for
    /// `(engine, profile)`. Only entries targeting `default` with a profile
    /// it actually offers count; otherwise the baseline is used.
    pub fn resolve(
        &self,
        engine: &str,
        profile: &str,
        default: &EngineDescriptor,
    ) -> Option<ResolvedProfile> {
        if let Some(mapping) = self.lookup(engine, profile) {
            if mapping.target_engine == default.id && default.profile(&mapping.target_profile).is_some()
            {
                return Some(ResolvedProfile {
                    profile_id: mapping.target_profile.clone(),
                    mapped: true,
                });
            }
        }
        default.baseline().map(|p| ResolvedProfile {
            profile_id: p.id.clone(),
            mapped: false,
        })
    }

    /// Every profile of every non-default inference engine that would fall
    /// back to the baseline, plus entries pointing at unknown profiles
    pub fn audit(&self, registry: &EngineRegistry, default_engine: &str) -> Result<Vec<ProfileGap>> {
        let default = registry.get(default_engine)?;
        let mut gaps = Vec::new();

        for descriptor in registry.list_inference()? {
            if descriptor.id == default.id {
                continue;
            }
            for profile in &descriptor.profiles {
                let reason = match self.lookup(&descriptor.id, &profile.id) {
                    None => Some("no mapping; baseline will be used".to_string()),
                    Some(m) if m.target_engine != default.id => Some(format!(
                        "mapping targets '{}', not the default engine",
                        m.target_engine
                    )),
                    Some(m) if default.profile(&m.target_profile).is_none() => Some(format!(
                        "default engine has no profile '{}'",
                        m.target_profile
                    )),
                    Some(_) => None,
                };
                if let Some(reason) = reason {
                    gaps.push(ProfileGap {
                        engine: descriptor.id.clone(),
                        profile: profile.id.clone(),
                        reason,
                    });
                }
            }
        }

        Ok(gaps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::descriptor::QualityProfile;

    fn registry() -> EngineRegistry {
        let registry = EngineRegistry::new();
        registry
            .register(
                EngineDescriptor::builder("xtts")
                    .baseline(QualityProfile::new("balanced"))
                    .profile(QualityProfile::new("expressive"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                EngineDescriptor::builder("f5tts")
                    .baseline(QualityProfile::new("balanced"))
                    .profile(QualityProfile::new("ultra_natural"))
                    .profile(QualityProfile::new("fast"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_resolve_uses_mapping_then_baseline() {
        let registry = registry();
        let default = registry.get("xtts").unwrap();
        let mut map = QualityProfileMap::new();
        map.insert("f5tts", "ultra_natural", "xtts", "expressive");

        let mapped = map.resolve("f5tts", "ultra_natural", &default).unwrap();
        assert_eq!(mapped.profile_id, "expressive");
        assert!(mapped.mapped);

        let baseline = map.resolve("f5tts", "fast", &default).unwrap();
        assert_eq!(baseline.profile_id, "balanced");
        assert!(!baseline.mapped);
    }

    #[test]
    fn test_resolve_ignores_entries_for_other_targets() {
        let registry = registry();
        let default = registry.get("xtts").unwrap();
        let mut map = QualityProfileMap::new();
        map.insert("f5tts", "fast", "styletts2", "fast")
            .insert("f5tts", "balanced", "xtts", "missing");

        assert!(!map.resolve("f5tts", "fast", &default).unwrap().mapped);
        assert!(!map.resolve("f5tts", "balanced", &default).unwrap().mapped);
    }

    #[test]
    fn test_audit_reports_gaps() {
        let registry = registry();
        let mut map = QualityProfileMap::new();
        map.insert("f5tts", "ultra_natural", "xtts", "expressive")
            .insert("f5tts", "balanced", "xtts", "nonexistent");

        let gaps = map.audit(&registry, "xtts").unwrap();
        let keys: Vec<_> = gaps.iter().map(|g| g.profile.as_str()).collect();
        assert_eq!(keys, vec!["balanced", "fast"]);
        assert!(gaps[0].reason.contains("nonexistent"));
        assert!(map.audit(&registry, "nope").is_err());
    }
}
