//! Training run controller
//!
//! Drives a [`TrainingBackend`] through its epochs while:
//! - resuming from the newest checkpoint on disk
//! - writing numbered checkpoints (pruned to `keep_last`) and a `latest`
//!   crash-recovery checkpoint at their own cadences
//! - rendering audio previews from checkpoint weights by swapping the
//!   training model out for an inference engine through the lifecycle
//!   manager, then swapping it back
//!
//! ```text
//! NotStarted -> Resuming -> Running <-> Sampling
//!                              |
//!                              +-> Completed | Failed
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::core::config::TrainingConfig;
use crate::core::error::{Result, TtsError};
use crate::core::metrics::{names, MetricsCollector};
use crate::engine::{
    EngineDescriptor, EngineKind, FactoryStrategy, QualityProfile, SynthesisEngine,
    SynthesisMode, SynthesisRequest,
};
use crate::lifecycle::{Lease, ModelLifecycleManager};
use super::backend::{TrainingBackend, TrainingSnapshot, UpdateContext, UpdateOutcome};
use super::checkpoint::{CheckpointKind, CheckpointPosition, CheckpointRecord, CheckpointStore};
use super::residency::{lock_backend, SharedBackend, TrainingResidency};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    NotStarted,
    Resuming,
    Running,
    Sampling,
    Completed,
    Failed,
}

/// Observable state of a run
#[derive(Debug, Clone, Serialize)]
pub struct TrainingProgress {
    pub phase: TrainingPhase,
    /// Updates completed so far, including those before a resume
    pub sequence: u64,
    pub total_updates: u64,
    pub epoch: u64,
    pub step_in_epoch: u64,
    pub last_loss: Option<f64>,
    pub best_metric: Option<f64>,
    pub last_checkpoint: Option<u64>,
    pub resumed_from: Option<u64>,
    pub samples_written: u64,
    pub sampling_failures: u64,
}

impl Default for TrainingProgress {
    fn default() -> Self {
        Self {
            phase: TrainingPhase::NotStarted,
            sequence: 0,
            total_updates: 0,
            epoch: 0,
            step_in_epoch: 0,
            last_loss: None,
            best_metric: None,
            last_checkpoint: None,
            resumed_from: None,
            samples_written: 0,
            sampling_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub resumed_from: Option<u64>,
    pub final_sequence: u64,
    /// Updates executed by this run
    pub updates_run: u64,
    pub best_metric: Option<f64>,
    pub last_loss: Option<f64>,
    /// Numbered checkpoints left on disk
    pub retained: Vec<u64>,
    pub samples_written: u64,
    pub sampling_failures: u64,
    pub duration_ms: u64,
}

/// Fixed input rendered at every preview
#[derive(Debug, Clone)]
pub struct PreviewSpec {
    pub text: String,
    /// Reference recording, copied next to the generated preview and used
    /// as the cloning voice when the sample engine supports it
    pub reference_audio: Option<PathBuf>,
    pub language: Option<String>,
}

impl PreviewSpec {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reference_audio: None,
            language: None,
        }
    }

    pub fn reference(mut self, path: impl Into<PathBuf>) -> Self {
        self.reference_audio = Some(path.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

pub type ProgressCallback = Box<dyn Fn(TrainingPhase, &TrainingProgress) + Send + Sync>;

/// Where the run stands between updates
#[derive(Debug, Default)]
struct Cursor {
    sequence: u64,
    epoch: u64,
    /// Updates completed within `epoch`
    step_in_epoch: u64,
    global_step: u64,
    best_metric: Option<f64>,
    last_loss: Option<f64>,
    numbered: Option<CheckpointRecord>,
    latest: Option<CheckpointRecord>,
}

impl Cursor {
    fn next_update(&self, updates_per_epoch: u64) -> UpdateContext {
        let (epoch, step_in_epoch) = if self.step_in_epoch >= updates_per_epoch {
            (self.epoch + 1, 0)
        } else {
            (self.epoch, self.step_in_epoch)
        };
        UpdateContext {
            update: self.sequence + 1,
            epoch,
            step_in_epoch,
        }
    }

    fn advance(&mut self, ctx: &UpdateContext, outcome: &UpdateOutcome) {
        self.sequence = ctx.update;
        self.epoch = ctx.epoch;
        self.step_in_epoch = ctx.step_in_epoch + 1;
        self.global_step = outcome.global_step;
        self.last_loss = Some(outcome.loss);
        self.best_metric = Some(match self.best_metric {
            Some(best) => best.min(outcome.loss),
            None => outcome.loss,
        });
    }

    fn position(&self, updates_per_epoch: u64) -> CheckpointPosition {
        CheckpointPosition {
            sequence: self.sequence,
            epoch: self.epoch,
            step_in_epoch: self.step_in_epoch,
            updates_per_epoch,
            best_metric: self.best_metric,
            last_loss: self.last_loss,
        }
    }

    /// A checkpoint already written for the current update
    fn current_checkpoint(&self) -> Option<&CheckpointRecord> {
        [self.numbered.as_ref(), self.latest.as_ref()]
            .into_iter()
            .flatten()
            .find(|r| r.meta.sequence == self.sequence)
    }
}

pub struct CheckpointManager {
    config: TrainingConfig,
    lifecycle: ModelLifecycleManager,
    backend: SharedBackend,
    store: CheckpointStore,
    /// Residency of the training model under the lifecycle manager
    descriptor: Arc<EngineDescriptor>,
    previews: Vec<PreviewSpec>,
    on_progress: Option<ProgressCallback>,
    progress: Mutex<TrainingProgress>,
    metrics: MetricsCollector,
}

impl CheckpointManager {
    pub fn new(
        config: TrainingConfig,
        lifecycle: ModelLifecycleManager,
        backend: SharedBackend,
    ) -> Result<Self> {
        if config.save_every == 0 || config.latest_every == 0 {
            return Err(TtsError::Config {
                message: "checkpoint cadences must be at least 1".to_string(),
                path: None,
            });
        }
        if lifecycle.registry().is_registered(&config.training_engine) {
            return Err(TtsError::Config {
                message: format!(
                    "training engine id '{}' collides with a registered engine",
                    config.training_engine
                ),
                path: None,
            });
        }

        let components = lock_backend(&backend, "CheckpointManager::new")?.components();
        let factory_backend = Arc::clone(&backend);
        let descriptor = EngineDescriptor::builder(config.training_engine.clone())
            .name("training state")
            .kind(EngineKind::Training)
            .components(components)
            .strategy(FactoryStrategy::new("training-state", move |ctx| {
                let residency = TrainingResidency::attach(
                    ctx.descriptor.id.clone(),
                    Arc::clone(&factory_backend),
                    ctx.placement,
                )?;
                Ok(Box::new(residency) as Box<dyn SynthesisEngine>)
            }))
            .build()?;

        let store = CheckpointStore::open(&config.checkpoint_dir, config.keep_last)?;
        let metrics = lifecycle.metrics().clone();

        Ok(Self {
            config,
            lifecycle,
            backend,
            store,
            descriptor: Arc::new(descriptor),
            previews: Vec::new(),
            on_progress: None,
            progress: Mutex::new(TrainingProgress::default()),
            metrics,
        })
    }

    pub fn with_previews(mut self, previews: Vec<PreviewSpec>) -> Self {
        self.previews = previews;
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(TrainingPhase, &TrainingProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn phase(&self) -> TrainingPhase {
        self.progress().phase
    }

    pub fn progress(&self) -> TrainingProgress {
        match self.progress.lock() {
            Ok(progress) => progress.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, update: impl FnOnce(&mut TrainingProgress)) {
        let snapshot = {
            let mut progress = match self.progress.lock() {
                Ok(progress) => progress,
                Err(poisoned) => poisoned.into_inner(),
            };
            update(&mut progress);
            progress.clone()
        };
        if let Some(callback) = &self.on_progress {
            callback(snapshot.phase, &snapshot);
        }
    }

    fn set_phase(&self, phase: TrainingPhase) {
        debug!("Training phase -> {:?}", phase);
        self.publish(|p| p.phase = phase);
    }

    fn with_backend<R>(
        &self,
        location: &str,
        f: impl FnOnce(&mut dyn TrainingBackend) -> Result<R>,
    ) -> Result<R> {
        let mut guard = lock_backend(&self.backend, location)?;
        f(&mut **guard)
    }

    fn sampling_enabled(&self) -> bool {
        self.config.sample_every > 0 && !self.previews.is_empty()
    }

    /// Train to the configured number of epochs, resuming if checkpoints
    /// exist. Sampling problems never fail the run.
    pub async fn run(&self) -> Result<TrainingReport> {
        let started = Instant::now();
        match self.train(started).await {
            Ok(report) => {
                self.set_phase(TrainingPhase::Completed);
                info!(
                    "Training completed at update {} ({} run, best loss {:?})",
                    report.final_sequence, report.updates_run, report.best_metric
                );
                Ok(report)
            }
            Err(e) => {
                error!("Training failed: {}", e);
                self.set_phase(TrainingPhase::Failed);
                Err(e)
            }
        }
    }

    async fn train(&self, started: Instant) -> Result<TrainingReport> {
        self.set_phase(TrainingPhase::Resuming);
        if self.sampling_enabled() {
            self.sample_descriptor()?;
        }

        let updates_per_epoch =
            self.with_backend("CheckpointManager::run", |b| Ok(b.updates_per_epoch()))?;
        if updates_per_epoch == 0 {
            return Err(TtsError::Config {
                message: "training backend reports zero updates per epoch".to_string(),
                path: None,
            });
        }

        let mut cursor = self.resume(updates_per_epoch).await?;
        let resumed_from = cursor.current_checkpoint().map(|r| r.meta.sequence);
        let total = self.config.epochs * updates_per_epoch;
        self.publish(|p| {
            p.total_updates = total;
            p.sequence = cursor.sequence;
            p.epoch = cursor.epoch;
            p.step_in_epoch = cursor.step_in_epoch;
            p.best_metric = cursor.best_metric;
            p.last_loss = cursor.last_loss;
            p.last_checkpoint = resumed_from;
            p.resumed_from = resumed_from;
        });

        let mut lease = self.acquire_training().await?;
        self.set_phase(TrainingPhase::Running);

        let mut updates_run = 0u64;
        let mut samples_written = 0u64;
        let mut sampling_failures = 0u64;

        while cursor.sequence < total {
            let ctx = cursor.next_update(updates_per_epoch);
            let outcome = self.with_backend("CheckpointManager::train_update", |b| {
                b.train_update(&ctx)
            })?;
            if outcome.global_step <= cursor.global_step {
                return Err(TtsError::Internal {
                    message: format!(
                        "global step went from {} to {} at update {}",
                        cursor.global_step, outcome.global_step, ctx.update
                    ),
                    location: Some("CheckpointManager::train".to_string()),
                });
            }
            cursor.advance(&ctx, &outcome);
            updates_run += 1;

            self.apply_cadences(&mut cursor, updates_per_epoch)?;

            if self.sampling_enabled() && cursor.sequence % self.config.sample_every == 0 {
                let record = self.checkpoint_for_sampling(&mut cursor, updates_per_epoch)?;
                self.set_phase(TrainingPhase::Sampling);
                self.lifecycle.release(lease);

                match self.render_previews(&record).await {
                    Ok(n) => {
                        samples_written += n;
                        self.metrics.increment_counter(names::SAMPLES_WRITTEN, n);
                    }
                    Err(e) => {
                        sampling_failures += 1;
                        self.metrics.increment_counter(names::SAMPLING_FAILURES, 1);
                        warn!("Sampling at update {} failed: {}", cursor.sequence, e);
                    }
                }

                lease = self.acquire_training().await?;
                self.set_phase(TrainingPhase::Running);
            }

            self.publish(|p| {
                p.sequence = cursor.sequence;
                p.epoch = cursor.epoch;
                p.step_in_epoch = cursor.step_in_epoch;
                p.last_loss = cursor.last_loss;
                p.best_metric = cursor.best_metric;
                p.last_checkpoint = cursor
                    .numbered
                    .iter()
                    .chain(cursor.latest.iter())
                    .map(|r| r.meta.sequence)
                    .max();
                p.samples_written = samples_written;
                p.sampling_failures = sampling_failures;
            });
        }

        if updates_run > 0 && cursor.latest.as_ref().map(|r| r.meta.sequence) != Some(cursor.sequence) {
            self.write_latest(&mut cursor, updates_per_epoch)?;
        }
        self.lifecycle.release(lease);

        Ok(TrainingReport {
            resumed_from,
            final_sequence: cursor.sequence,
            updates_run,
            best_metric: cursor.best_metric,
            last_loss: cursor.last_loss,
            retained: self.store.numbered()?,
            samples_written,
            sampling_failures,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Checkpoint lookup and tensor reads run on the blocking pool
    async fn resume(&self, updates_per_epoch: u64) -> Result<Cursor> {
        let store = self.store.clone();
        type Found = Option<(CheckpointRecord, TrainingSnapshot)>;
        let found = tokio::task::spawn_blocking(move || -> Result<Found> {
            let Some(record) = store.find_resume_point()? else {
                return Ok(None);
            };
            let meta = &record.meta;
            if meta.updates_per_epoch != updates_per_epoch {
                return Err(TtsError::Config {
                    message: format!(
                        "checkpoint {} was written with {} updates per epoch, backend has {}",
                        meta.sequence, meta.updates_per_epoch, updates_per_epoch
                    ),
                    path: Some(record.meta_path.clone()),
                });
            }
            let snapshot = store.load(&record)?;
            Ok(Some((record, snapshot)))
        })
        .await
        .map_err(|e| TtsError::Internal {
            message: format!("checkpoint lookup task failed: {}", e),
            location: Some("CheckpointManager::resume".to_string()),
        })??;

        let Some((record, snapshot)) = found else {
            info!("No checkpoint in {}; starting fresh", self.store.dir().display());
            return Ok(Cursor::default());
        };

        let meta = &record.meta;
        self.with_backend("CheckpointManager::resume", |b| b.restore(snapshot))
            .map_err(|e| match e {
                TtsError::Validation { message, .. } => {
                    TtsError::corrupt(&record.weights_path, message)
                }
                other => other,
            })?;

        info!(
            "Resuming from {:?} checkpoint {} (epoch {}, step {})",
            record.kind, meta.sequence, meta.epoch, meta.step_in_epoch
        );

        let mut cursor = Cursor {
            sequence: meta.sequence,
            epoch: meta.epoch,
            step_in_epoch: meta.step_in_epoch,
            global_step: meta.global_step,
            best_metric: meta.best_metric,
            last_loss: meta.last_loss,
            numbered: None,
            latest: None,
        };
        match record.kind {
            CheckpointKind::Numbered => cursor.numbered = Some(record),
            CheckpointKind::Latest => cursor.latest = Some(record),
        }
        Ok(cursor)
    }

    async fn acquire_training(&self) -> Result<Lease> {
        self.lifecycle
            .acquire_descriptor(Arc::clone(&self.descriptor))
            .await
    }

    fn write(
        &self,
        kind: CheckpointKind,
        cursor: &Cursor,
        updates_per_epoch: u64,
    ) -> Result<CheckpointRecord> {
        let snapshot = self.with_backend("CheckpointManager::snapshot", |b| b.snapshot())?;
        self.store
            .write(kind, &snapshot, &cursor.position(updates_per_epoch))
    }

    fn write_latest(&self, cursor: &mut Cursor, updates_per_epoch: u64) -> Result<()> {
        let record = self.write(CheckpointKind::Latest, cursor, updates_per_epoch)?;
        self.metrics.increment_counter(names::LATEST_WRITTEN, 1);
        cursor.latest = Some(record);
        Ok(())
    }

    fn apply_cadences(&self, cursor: &mut Cursor, updates_per_epoch: u64) -> Result<()> {
        if cursor.sequence % self.config.save_every == 0 {
            let record = self.write(CheckpointKind::Numbered, cursor, updates_per_epoch)?;
            self.metrics.increment_counter(names::CHECKPOINTS_WRITTEN, 1);
            info!(
                "Checkpoint {} saved (epoch {}, loss {:.6})",
                record.meta.sequence,
                record.meta.epoch,
                cursor.last_loss.unwrap_or_default()
            );
            cursor.numbered = Some(record);

            let pruned = self.store.prune()?;
            self.metrics
                .increment_counter(names::CHECKPOINTS_PRUNED, pruned.len() as u64);
        }

        if cursor.sequence % self.config.latest_every == 0 {
            self.write_latest(cursor, updates_per_epoch)?;
        }
        Ok(())
    }

    fn checkpoint_for_sampling(
        &self,
        cursor: &mut Cursor,
        updates_per_epoch: u64,
    ) -> Result<CheckpointRecord> {
        if let Some(record) = cursor.current_checkpoint() {
            return Ok(record.clone());
        }
        self.write_latest(cursor, updates_per_epoch)?;
        cursor
            .current_checkpoint()
            .cloned()
            .ok_or_else(|| TtsError::Internal {
                message: "latest checkpoint missing after write".to_string(),
                location: Some("CheckpointManager::checkpoint_for_sampling".to_string()),
            })
    }

    fn sample_descriptor(&self) -> Result<Arc<EngineDescriptor>> {
        let descriptor = self
            .lifecycle
            .registry()
            .get(&self.config.sample_engine)
            .map_err(|_| TtsError::Config {
                message: format!("sample engine '{}' is not registered", self.config.sample_engine),
                path: None,
            })?;
        if descriptor.kind != EngineKind::Inference {
            return Err(TtsError::Config {
                message: format!("sample engine '{}' cannot synthesize", descriptor.id),
                path: None,
            });
        }
        Ok(descriptor)
    }

    fn sample_profile(&self, descriptor: &EngineDescriptor) -> Result<QualityProfile> {
        let profile = match &self.config.sample_profile {
            Some(id) => descriptor.profile(id),
            None => descriptor.baseline(),
        };
        profile.cloned().ok_or_else(|| TtsError::Config {
            message: format!(
                "sample engine '{}' has no profile {:?}",
                descriptor.id, self.config.sample_profile
            ),
            path: None,
        })
    }

    /// Load the checkpoint's weights into the sample engine and write one
    /// preview per spec. Returns the number of previews written.
    async fn render_previews(&self, record: &CheckpointRecord) -> Result<u64> {
        let base = self.sample_descriptor()?;
        let sequence = record.meta.sequence;
        let derived = Arc::new(
            base.derive_with_weights(format!("{}@{:08}", base.id, sequence), &record.weights_path),
        );
        let profile = self.sample_profile(&derived)?;

        let lease = self.lifecycle.acquire_descriptor(Arc::clone(&derived)).await?;
        let result = self.write_previews(&lease, &profile, sequence).await;
        self.lifecycle.release(lease);

        // Previews must not hold a residency slot between excursions
        if self.lifecycle.is_resident(&derived.id) {
            if let Err(e) = self.lifecycle.evict(&derived.id) {
                warn!("Failed to evict preview engine {}: {}", derived.id, e);
            }
        }
        result
    }

    async fn write_previews(
        &self,
        lease: &Lease,
        profile: &QualityProfile,
        sequence: u64,
    ) -> Result<u64> {
        let samples_dir = self.store.samples_dir();
        let cloning = lease.descriptor().capabilities.supports_cloning;
        let mut written = 0;

        for (n, preview) in self.previews.iter().enumerate() {
            let voice = match (&preview.reference_audio, cloning) {
                (Some(path), true) => Some(path.display().to_string()),
                _ => None,
            };
            let request = SynthesisRequest {
                text: preview.text.clone(),
                mode: if voice.is_some() {
                    SynthesisMode::Cloned
                } else {
                    SynthesisMode::Direct
                },
                voice,
                language: preview.language.clone(),
                request_id: Some(format!("sample-{:08}-{}", sequence, n)),
            };

            let output = lease.synthesize(&request, profile).await?;
            let generated = samples_dir.join(format!("{:08}_generated_{}.wav", sequence, n));
            output.save_wav(&generated)?;

            if let Some(reference) = &preview.reference_audio {
                copy_reference(reference, &samples_dir, sequence, n)?;
            }
            debug!("Preview {} for update {} written to {}", n, sequence, generated.display());
            written += 1;
        }
        Ok(written)
    }
}

fn copy_reference(reference: &Path, samples_dir: &Path, sequence: u64, n: usize) -> Result<()> {
    let ext = reference
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("wav");
    let target = samples_dir.join(format!("{:08}_reference_{}.{}", sequence, n, ext));
    std::fs::copy(reference, &target).map_err(|e| TtsError::Io {
        message: format!("Failed to copy reference audio: {}", e),
        path: Some(reference.to_path_buf()),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::LifecycleConfig;
    use crate::engine::{EngineRegistry, Placement};
    use crate::training::reference::ReferenceTrainer;
    use crate::training::residency::shared_backend;

    fn lifecycle() -> ModelLifecycleManager {
        ModelLifecycleManager::new(
            Arc::new(EngineRegistry::new()),
            LifecycleConfig {
                use_accelerator: false,
                ..Default::default()
            },
        )
    }

    fn config(dir: &Path) -> TrainingConfig {
        TrainingConfig {
            checkpoint_dir: dir.to_path_buf(),
            save_every: 4,
            latest_every: 3,
            keep_last: 2,
            sample_every: 0,
            epochs: 2,
            ..Default::default()
        }
    }

    fn backend(updates_per_epoch: u64) -> SharedBackend {
        shared_backend(
            ReferenceTrainer::new(&["gpt".to_string()], 32, updates_per_epoch, Placement::Host)
                .unwrap(),
        )
    }

    #[test]
    fn test_cursor_rolls_over_epochs() {
        let mut cursor = Cursor::default();
        for update in 1..=3 {
            let ctx = cursor.next_update(3);
            assert_eq!(ctx.update, update);
            assert_eq!(ctx.epoch, 0);
            cursor.advance(&ctx, &UpdateOutcome { loss: 1.0 / update as f64, global_step: update });
        }
        let ctx = cursor.next_update(3);
        assert_eq!((ctx.epoch, ctx.step_in_epoch), (1, 0));
        assert_eq!(cursor.best_metric, Some(1.0 / 3.0));
    }

    #[tokio::test]
    async fn test_cadences_and_retention() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(config(dir.path()), lifecycle(), backend(5)).unwrap();
        assert_eq!(manager.phase(), TrainingPhase::NotStarted);

        let report = manager.run().await.unwrap();
        assert_eq!(report.final_sequence, 10);
        assert_eq!(report.updates_run, 10);
        assert_eq!(report.retained, vec![4, 8]);
        assert_eq!(manager.phase(), TrainingPhase::Completed);

        let latest = manager.store().latest().unwrap().unwrap();
        assert_eq!(latest.meta.sequence, 10);
        assert_eq!((latest.meta.epoch, latest.meta.step_in_epoch), (1, 5));
    }

    #[tokio::test]
    async fn test_completed_run_resumes_without_updates() {
        let dir = tempfile::tempdir().unwrap();
        let first = CheckpointManager::new(config(dir.path()), lifecycle(), backend(5)).unwrap();
        first.run().await.unwrap();

        let second = CheckpointManager::new(config(dir.path()), lifecycle(), backend(5)).unwrap();
        let report = second.run().await.unwrap();
        assert_eq!(report.resumed_from, Some(10));
        assert_eq!(report.updates_run, 0);
    }

    #[tokio::test]
    async fn test_epoch_size_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        CheckpointManager::new(config(dir.path()), lifecycle(), backend(5))
            .unwrap()
            .run()
            .await
            .unwrap();

        let other = CheckpointManager::new(config(dir.path()), lifecycle(), backend(4)).unwrap();
        let err = other.run().await.unwrap_err();
        assert!(matches!(err, TtsError::Config { .. }));
        assert_eq!(other.phase(), TrainingPhase::Failed);
    }

    #[tokio::test]
    async fn test_training_lease_released_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = lifecycle();
        let manager =
            CheckpointManager::new(config(dir.path()), lifecycle.clone(), backend(2)).unwrap();
        manager.run().await.unwrap();
        // Constrained mode evicts on the last release
        assert!(!lifecycle.is_resident("trainer"));
    }
}
