//! Integration tests for job orchestration over the lifecycle manager
//!
//! Engines load real safetensors weights written into a temporary models
//! directory; an engine without weights is unavailable.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use voxhost::core::error::{ErrorKind, ExecutionStage, Result, TtsError};
use voxhost::core::metrics::names;
use voxhost::engine::strategy::WEIGHTS_FILE;
use voxhost::engine::{
    builtin_profile_map, register_builtin, EngineDescriptor, EngineRegistry, FactoryStrategy,
    Footprint, Placement, PretrainedStrategy, QualityProfile, ReferenceEngine, SynthesisEngine,
    SynthesisOutput, SynthesisRequest,
};
use voxhost::jobs::{FileJobStore, InMemoryJobStore, JobOrchestrator, JobRequest, JobStatus, JobStore};
use voxhost::lifecycle::ModelLifecycleManager;
use voxhost::{LifecycleConfig, OrchestratorConfig};

struct Harness {
    dir: TempDir,
    registry: Arc<EngineRegistry>,
    lifecycle: ModelLifecycleManager,
}

impl Harness {
    /// Built-in catalog with weights for the listed engines only
    fn new(with_weights: &[&str]) -> Self {
        Self::with_config(with_weights, |_| {})
    }

    fn with_config(with_weights: &[&str], tweak: impl FnOnce(&mut LifecycleConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LifecycleConfig {
            models_dir: dir.path().join("models"),
            ..Default::default()
        };
        tweak(&mut config);

        let registry = Arc::new(EngineRegistry::new());
        register_builtin(&registry, &config).unwrap();
        for id in with_weights {
            seed_weights(&registry, &config.models_dir, id);
        }

        let lifecycle = ModelLifecycleManager::new(Arc::clone(&registry), config);
        Self {
            dir,
            registry,
            lifecycle,
        }
    }

    fn orchestrator(&self) -> JobOrchestrator {
        self.orchestrator_with(OrchestratorConfig::default(), Arc::new(InMemoryJobStore::new()))
    }

    fn orchestrator_with(
        &self,
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
    ) -> JobOrchestrator {
        JobOrchestrator::new(self.lifecycle.clone(), store, builtin_profile_map(), config).unwrap()
    }
}

fn seed_weights(registry: &EngineRegistry, models_dir: &Path, id: &str) {
    let descriptor = registry.get(id).unwrap();
    let engine = ReferenceEngine::random_init(&descriptor, Placement::Host).unwrap();
    let family_dir = models_dir.join(&descriptor.family);
    std::fs::create_dir_all(&family_dir).unwrap();
    engine.save_weights(family_dir.join(WEIGHTS_FILE)).unwrap();
}

/// Loads fine, then fails every synthesis with a transient error
struct FlakyEngine {
    id: String,
    placement: Placement,
}

#[async_trait]
impl SynthesisEngine for FlakyEngine {
    fn engine_id(&self) -> &str {
        &self.id
    }

    fn placement(&self) -> Placement {
        self.placement
    }

    fn relocate_root(&mut self, target: Placement) -> Result<()> {
        self.placement = target;
        Ok(())
    }

    fn relocate_component(&mut self, _component: &str, _target: Placement) -> Result<()> {
        Ok(())
    }

    fn footprint(&self) -> Footprint {
        Footprint::on(self.placement, 1024)
    }

    async fn synthesize(
        &self,
        _request: &SynthesisRequest,
        _profile: &QualityProfile,
    ) -> Result<SynthesisOutput> {
        Err(TtsError::Execution {
            engine_id: self.id.clone(),
            stage: ExecutionStage::Synthesis,
            message: "decoder ran out of scratch memory".to_string(),
            recoverable: true,
        })
    }
}

/// Serves normally but leaves its vocoder stuck on the accelerator
struct StickyEngine {
    id: String,
    placement: Placement,
}

#[async_trait]
impl SynthesisEngine for StickyEngine {
    fn engine_id(&self) -> &str {
        &self.id
    }

    fn placement(&self) -> Placement {
        self.placement
    }

    fn relocate_root(&mut self, target: Placement) -> Result<()> {
        self.placement = target;
        Ok(())
    }

    fn relocate_component(&mut self, component: &str, target: Placement) -> Result<()> {
        if component == "vocoder" {
            return Err(TtsError::Internal {
                message: format!("vocoder pinned, cannot move to {}", target),
                location: None,
            });
        }
        Ok(())
    }

    fn footprint(&self) -> Footprint {
        Footprint::on(self.placement, 2048)
    }

    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        _profile: &QualityProfile,
    ) -> Result<SynthesisOutput> {
        Ok(SynthesisOutput::new(vec![0.1; request.text.len() * 100], 22050))
    }
}

#[tokio::test]
async fn test_healthy_engine_serves_without_fallback() {
    let harness = Harness::new(&["xtts", "styletts2"]);
    let orchestrator = harness.orchestrator();

    let job = orchestrator
        .submit(JobRequest::new("Hello there", "styletts2").profile("expressive"))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.used_engine_id.as_deref(), Some("styletts2"));
    assert_eq!(job.used_quality_profile_id.as_deref(), Some("expressive"));
    assert!(!job.fallback);
    assert!(job.fallback_reason.is_none());
    assert!(job.provenance_consistent());
    assert!(job.audio.as_ref().unwrap().duration_secs > 0.0);
}

#[tokio::test]
async fn test_unavailable_engine_falls_back_with_mapped_profile() {
    let harness = Harness::new(&["xtts"]);
    let orchestrator = harness.orchestrator();

    let job = orchestrator
        .submit(JobRequest::new("Hello there", "f5tts").profile("ultra_natural"))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.requested_engine_id, "f5tts");
    assert_eq!(job.requested_quality_profile_id, "ultra_natural");
    assert_eq!(job.used_engine_id.as_deref(), Some("xtts"));
    assert_eq!(job.used_quality_profile_id.as_deref(), Some("expressive"));
    assert!(job.fallback);
    assert!(job.fallback_reason.as_deref().unwrap().contains("f5tts"));
    assert!(job.provenance_consistent());

    // The stored record carries the same provenance
    let stored = orchestrator.status(&job.id).unwrap().unwrap();
    assert_eq!(stored.used_engine_id.as_deref(), Some("xtts"));
    assert!(stored.fallback);
    assert_eq!(
        harness.lifecycle.metrics().get_counter(voxhost::core::metrics::names::FALLBACKS),
        1
    );
}

#[tokio::test]
async fn test_unmapped_profile_falls_back_to_baseline() {
    let harness = Harness::new(&["xtts"]);
    harness
        .registry
        .register(
            EngineDescriptor::builder("tacotron")
                .component("decoder")
                .baseline(QualityProfile::new("whisper"))
                .strategy(PretrainedStrategy)
                .build()
                .unwrap(),
        )
        .unwrap();
    let orchestrator = harness.orchestrator();

    let job = orchestrator
        .submit(JobRequest::new("Quietly now", "tacotron"))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.used_engine_id.as_deref(), Some("xtts"));
    assert_eq!(job.used_quality_profile_id.as_deref(), Some("balanced"));
    assert!(job.fallback_reason.unwrap().contains("baseline"));

    let gaps = orchestrator.profile_gaps().unwrap();
    assert!(gaps.iter().any(|g| g.engine == "tacotron" && g.profile == "whisper"));
}

#[tokio::test]
async fn test_transient_execution_error_falls_back() {
    let harness = Harness::new(&["xtts"]);
    harness
        .registry
        .register(
            EngineDescriptor::builder("flaky")
                .baseline(QualityProfile::new("balanced"))
                .strategy(FactoryStrategy::new("fixture", |ctx| {
                    Ok(Box::new(FlakyEngine {
                        id: ctx.descriptor.id.clone(),
                        placement: ctx.placement,
                    }) as Box<dyn SynthesisEngine>)
                }))
                .build()
                .unwrap(),
        )
        .unwrap();
    let orchestrator = harness.orchestrator();

    let job = orchestrator
        .submit(JobRequest::new("Try again", "flaky"))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.used_engine_id.as_deref(), Some("xtts"));
    assert!(job.fallback_reason.unwrap().contains("scratch memory"));
}

#[tokio::test]
async fn test_default_engine_failure_never_falls_back() {
    let harness = Harness::new(&[]);
    let orchestrator = harness.orchestrator();

    let job = orchestrator
        .submit(JobRequest::new("Hello", "xtts"))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(!job.fallback);
    assert_eq!(job.used_engine_id.as_deref(), Some("xtts"));
    assert_eq!(job.error.as_ref().unwrap().kind, ErrorKind::EngineLoad);
    assert!(job.provenance_consistent());
}

#[tokio::test]
async fn test_failed_fallback_reports_default_error() {
    let harness = Harness::new(&[]);
    let orchestrator = harness.orchestrator();

    let job = orchestrator
        .submit(JobRequest::new("Hello", "f5tts").profile("fast"))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.fallback);
    assert_eq!(job.used_engine_id.as_deref(), Some("xtts"));
    assert_eq!(job.used_quality_profile_id.as_deref(), Some("fast"));
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::EngineLoad);
    assert!(error.message.contains("xtts"));
}

#[tokio::test]
async fn test_client_errors_create_no_job() {
    let harness = Harness::new(&["xtts"]);
    let orchestrator = harness.orchestrator();

    let err = orchestrator
        .submit(JobRequest::new("Hello", "nonexistent"))
        .await
        .unwrap_err();
    assert!(matches!(err, TtsError::UnknownEngine { .. }));

    let err = orchestrator
        .submit(JobRequest::new("Hello", "xtts").profile("cinematic"))
        .await
        .unwrap_err();
    assert!(matches!(err, TtsError::Validation { .. }));

    let err = orchestrator
        .submit(JobRequest::new("Hello", "styletts2").cloned("ref.wav"))
        .await
        .unwrap_err();
    assert!(matches!(err, TtsError::Validation { .. }));

    let err = orchestrator
        .submit(JobRequest::new("Bonjour", "styletts2").language("fr"))
        .await
        .unwrap_err();
    assert!(err.is_client_error());

    assert!(orchestrator.jobs().unwrap().is_empty());
}

#[tokio::test]
async fn test_acquire_timeout_fails_job_and_withdraws() {
    let harness = Harness::new(&["xtts", "styletts2"]);
    let orchestrator = harness.orchestrator_with(
        OrchestratorConfig {
            acquire_timeout_ms: 100,
            ..Default::default()
        },
        Arc::new(InMemoryJobStore::new()),
    );

    // Constrained mode: the only slot is held
    let held = harness.lifecycle.acquire("xtts").await.unwrap();

    let job = orchestrator
        .submit(JobRequest::new("Hello", "styletts2"))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert!(!job.fallback);

    harness.lifecycle.release(held);
    let job = orchestrator
        .submit(JobRequest::new("Hello", "styletts2"))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_concurrent_jobs_share_one_slot() {
    let harness = Harness::new(&["xtts", "styletts2"]);
    let orchestrator = Arc::new(harness.orchestrator());

    let first = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .submit(JobRequest::new("First job", "xtts"))
                .await
        })
    };
    let second = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .submit(JobRequest::new("Second job", "styletts2"))
                .await
        })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Completed);
    assert_eq!(second.status, JobStatus::Completed);
    assert!(!first.fallback && !second.fallback);

    // Every lease was released, and constrained mode evicted on release
    assert!(harness.lifecycle.resident().unwrap().is_empty());
    assert!(
        harness
            .lifecycle
            .metrics()
            .get_counter(voxhost::core::metrics::names::EVICTIONS)
            >= 2
    );
}

#[tokio::test]
async fn test_warm_engines_and_idempotent_evict() {
    let harness = Harness::with_config(&["xtts", "styletts2"], |c| {
        c.constrained = false;
        c.max_resident = 2;
    });
    let orchestrator = harness.orchestrator();

    orchestrator
        .submit(JobRequest::new("Warm", "xtts"))
        .await
        .unwrap();
    assert!(harness.lifecycle.is_resident("xtts"));

    let report = harness.lifecycle.evict("xtts").unwrap();
    assert!(report.was_resident);
    assert!(report.is_complete());
    assert!(report.freed_bytes > 0);
    assert_eq!(report.after.accelerator_bytes, 0);

    let again = harness.lifecycle.evict("xtts").unwrap();
    assert!(!again.was_resident);
    assert_eq!(again.freed_bytes, 0);
}

#[tokio::test]
async fn test_file_store_persists_every_transition() {
    let harness = Harness::new(&["xtts"]);
    let store_dir = harness.dir.path().join("jobs");
    let output_dir = harness.dir.path().join("out");
    let orchestrator = harness.orchestrator_with(
        OrchestratorConfig {
            job_store_dir: Some(store_dir.clone()),
            output_dir: Some(output_dir.clone()),
            ..Default::default()
        },
        Arc::new(FileJobStore::open(&store_dir).unwrap()),
    );

    let job = orchestrator
        .submit(JobRequest::new("Persist me", "f5tts"))
        .await
        .unwrap();

    let reopened = FileJobStore::open(&store_dir).unwrap();
    let stored = reopened.get(&job.id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.fallback);
    assert_eq!(stored.used_quality_profile_id.as_deref(), Some("balanced"));
    assert!(stored.started_at.is_some() && stored.finished_at.is_some());

    let wav = output_dir.join(format!("{}.wav", job.id));
    assert_eq!(stored.result_location.as_deref(), Some(wav.as_path()));
    let reader = hound::WavReader::open(&wav).unwrap();
    assert_eq!(reader.spec().bits_per_sample, 16);
}

#[tokio::test]
async fn test_health_reports_live_availability() {
    let harness = Harness::new(&["xtts"]);
    let orchestrator = harness.orchestrator();

    let health = orchestrator.health().unwrap();
    assert!(health.is_available("xtts"));
    assert!(!health.is_available("f5tts"));
    assert!(health.engine("f5tts").unwrap().detail.is_some());
    assert!(health.resident.is_empty());
}

#[tokio::test]
async fn test_corrupt_weights_reported_unavailable() {
    let harness = Harness::new(&["xtts", "f5tts"]);
    let family = harness.registry.get("f5tts").unwrap().family.clone();
    let weights = harness.dir.path().join("models").join(family).join(WEIGHTS_FILE);
    std::fs::write(&weights, b"\xff\xff\xff\xff\xff\xff\xff\x7fgarbage").unwrap();

    let orchestrator = harness.orchestrator();
    let before = orchestrator.health().unwrap();
    assert!(before.is_available("xtts"));
    assert!(!before.is_available("f5tts"));
    assert!(before.engine("f5tts").unwrap().detail.as_deref().unwrap().contains("pretrained"));

    let job = orchestrator
        .submit(JobRequest::new("Hello", "f5tts"))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.fallback);

    let after = orchestrator.health().unwrap();
    let f5 = after.engine("f5tts").unwrap();
    assert!(!after.is_available("f5tts"));
    assert!(f5.strategy.is_none());
    assert!(f5.last_load_error.is_some());
}

#[tokio::test]
async fn test_eviction_failure_surfaces_in_health_not_job() {
    let harness = Harness::new(&["xtts"]);
    harness
        .registry
        .register(
            EngineDescriptor::builder("sticky")
                .components(["encoder", "vocoder"])
                .baseline(QualityProfile::new("balanced"))
                .strategy(FactoryStrategy::new("fixture", |ctx| {
                    Ok(Box::new(StickyEngine {
                        id: ctx.descriptor.id.clone(),
                        placement: ctx.placement,
                    }) as Box<dyn SynthesisEngine>)
                }))
                .build()
                .unwrap(),
        )
        .unwrap();
    let orchestrator = harness.orchestrator();

    let job = orchestrator
        .submit(JobRequest::new("Pinned", "sticky"))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(!job.fallback);
    assert_eq!(job.used_engine_id.as_deref(), Some("sticky"));

    let health = orchestrator.health().unwrap();
    assert!(health.resident.is_empty());
    assert_eq!(health.eviction_failures.len(), 1);
    let failure = &health.eviction_failures[0];
    assert_eq!(failure.engine_id, "sticky");
    assert_eq!(failure.failed_components, vec!["vocoder".to_string()]);
    assert!(failure.message.contains("pinned"));
    assert_eq!(
        harness.lifecycle.metrics().get_counter(names::EVICTION_FAILURES),
        1
    );
}
