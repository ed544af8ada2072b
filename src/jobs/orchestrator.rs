//! Job orchestration with one-hop engine fallback
//!
//! Jobs are served one at a time in admission order. A recoverable failure
//! on the requested engine (every load strategy exhausted, or a transient
//! execution error) retries once on the default engine with the quality
//! profile translated through the [`QualityProfileMap`]. The job record
//! states what was asked for, what ran, and why they differ.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::config::OrchestratorConfig;
use crate::core::error::{ExecutionStage, Result, TtsError};
use crate::core::metrics::{names, MetricsCollector};
use crate::engine::{
    EngineDescriptor, EngineKind, EngineRegistry, ProfileGap, QualityProfileMap, SynthesisMode,
    SynthesisOutput, SynthesisRequest,
};
use crate::lifecycle::{HealthReport, ModelLifecycleManager};
use super::store::JobStore;
use super::types::{AudioSummary, Job, JobRequest};

/// Final job record plus the audio it produced
#[derive(Debug)]
pub struct Submission {
    pub job: Job,
    pub output: Option<SynthesisOutput>,
}

pub struct JobOrchestrator {
    registry: Arc<EngineRegistry>,
    lifecycle: ModelLifecycleManager,
    store: Arc<dyn JobStore>,
    profile_map: QualityProfileMap,
    config: OrchestratorConfig,
    /// Single permit; tokio semaphores serve waiters in FIFO order
    queue: Arc<Semaphore>,
    metrics: MetricsCollector,
}

impl JobOrchestrator {
    pub fn new(
        lifecycle: ModelLifecycleManager,
        store: Arc<dyn JobStore>,
        profile_map: QualityProfileMap,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let registry = Arc::clone(lifecycle.registry());
        let default = registry
            .get(&config.default_engine)
            .map_err(|_| TtsError::Config {
                message: format!("default engine '{}' is not registered", config.default_engine),
                path: None,
            })?;
        if default.kind != EngineKind::Inference {
            return Err(TtsError::Config {
                message: format!("default engine '{}' cannot synthesize", default.id),
                path: None,
            });
        }

        for gap in profile_map.audit(&registry, &default.id)? {
            warn!(
                "Fallback for {}/{} will use the {} baseline: {}",
                gap.engine, gap.profile, default.id, gap.reason
            );
        }

        let metrics = lifecycle.metrics().clone();
        Ok(Self {
            registry,
            lifecycle,
            store,
            profile_map,
            config,
            queue: Arc::new(Semaphore::new(1)),
            metrics,
        })
    }

    pub fn lifecycle(&self) -> &ModelLifecycleManager {
        &self.lifecycle
    }

    pub fn profile_map(&self) -> &QualityProfileMap {
        &self.profile_map
    }

    pub fn profile_gaps(&self) -> Result<Vec<ProfileGap>> {
        self.profile_map.audit(&self.registry, &self.config.default_engine)
    }

    pub fn status(&self, job_id: &str) -> Result<Option<Job>> {
        self.store.get(job_id)
    }

    pub fn jobs(&self) -> Result<Vec<Job>> {
        self.store.list()
    }

    pub fn health(&self) -> Result<HealthReport> {
        self.lifecycle.health()
    }

    /// Run a job to a terminal state and return its record.
    ///
    /// Client errors (unknown engine, invalid profile, language or mode) are
    /// returned as `Err` and create no job. Every other failure yields a
    /// `failed` job.
    pub async fn submit(&self, request: JobRequest) -> Result<Job> {
        Ok(self.submit_with_output(request).await?.job)
    }

    pub async fn submit_with_output(&self, request: JobRequest) -> Result<Submission> {
        let (descriptor, profile_id) = self.admit(&request).map_err(|e| {
            self.metrics.increment_counter(names::JOBS_REJECTED, 1);
            warn!("Rejected request for {}: {}", request.engine_id, e);
            e
        })?;

        let mut job = Job::new(&request, &profile_id);
        self.store.put(&job)?;
        self.metrics.increment_counter(names::JOBS_SUBMITTED, 1);
        info!("Job {} admitted for {} ({})", job.id, descriptor.id, profile_id);

        let deadline = self.config.acquire_timeout();
        let queued = Instant::now();
        let permit = match timeout(deadline, Arc::clone(&self.queue).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                let err = TtsError::Internal {
                    message: "job queue closed".to_string(),
                    location: Some("JobOrchestrator::submit".to_string()),
                };
                return self.finish_failed(job, err);
            }
            Err(_) => {
                let err = timeout_error("waiting in the job queue", deadline);
                return self.finish_failed(job, err);
            }
        };

        job.start();
        self.store.put(&job)?;

        let remaining = deadline.saturating_sub(queued.elapsed());
        let timer = self.metrics.start_timer(names::EXECUTE_TIME);
        let outcome = match self
            .run(&descriptor, &profile_id, &request, &job.id, remaining)
            .await
        {
            Ok(output) => Ok(output),
            Err(err) if err.is_recoverable() && descriptor.id != self.config.default_engine => {
                self.fall_back(&mut job, &descriptor, &profile_id, &request, err)
                    .await
            }
            Err(err) => Err(err),
        };
        timer.stop();
        drop(permit);

        match outcome {
            Ok(output) => self.finish_completed(job, output),
            Err(err) => self.finish_failed(job, err),
        }
    }

    fn admit(&self, request: &JobRequest) -> Result<(Arc<EngineDescriptor>, String)> {
        let descriptor = self.registry.get(&request.engine_id)?;
        if descriptor.kind != EngineKind::Inference {
            return Err(invalid("engine_id", format!("'{}' is not a synthesis engine", descriptor.id)));
        }
        if request.text.trim().is_empty() {
            return Err(invalid("text", "text must not be empty"));
        }

        let profile_id = match &request.quality_profile {
            Some(p) if descriptor.profile(p).is_some() => p.clone(),
            Some(p) => {
                return Err(invalid(
                    "quality_profile",
                    format!(
                        "'{}' has no profile '{}' (available: {})",
                        descriptor.id,
                        p,
                        descriptor.profile_ids().join(", ")
                    ),
                ))
            }
            None => descriptor
                .baseline_profile
                .clone()
                .ok_or_else(|| invalid("quality_profile", "engine has no baseline profile"))?,
        };

        if let Some(language) = &request.language {
            if !descriptor.supports_language(language) {
                return Err(invalid(
                    "language",
                    format!("'{}' does not support language '{}'", descriptor.id, language),
                ));
            }
        }

        if request.mode == SynthesisMode::Cloned {
            if !descriptor.capabilities.supports_cloning {
                return Err(invalid(
                    "mode",
                    format!("'{}' does not support voice cloning", descriptor.id),
                ));
            }
            if request.voice.is_none() {
                return Err(invalid("voice", "cloned mode requires a reference voice"));
            }
        }

        Ok((descriptor, profile_id))
    }

    /// Acquire within `budget`, synthesize, release
    async fn run(
        &self,
        descriptor: &Arc<EngineDescriptor>,
        profile_id: &str,
        request: &JobRequest,
        job_id: &str,
        budget: Duration,
    ) -> Result<SynthesisOutput> {
        let lease = match timeout(budget, self.lifecycle.acquire_descriptor(Arc::clone(descriptor))).await {
            Ok(lease) => lease?,
            Err(_) => {
                return Err(timeout_error(
                    &format!("acquiring engine '{}'", descriptor.id),
                    budget,
                ))
            }
        };

        let profile = descriptor
            .profile(profile_id)
            .cloned()
            .ok_or_else(|| invalid("quality_profile", format!("'{}' has no profile '{}'", descriptor.id, profile_id)))?;

        if request.mode == SynthesisMode::Cloned && !descriptor.capabilities.supports_cloning {
            return Err(TtsError::Execution {
                engine_id: descriptor.id.clone(),
                stage: ExecutionStage::Synthesis,
                message: "engine cannot clone voices".to_string(),
                recoverable: false,
            });
        }

        let synthesis = SynthesisRequest {
            text: request.text.clone(),
            voice: request.voice.clone(),
            language: request.language.clone(),
            mode: request.mode,
            request_id: Some(job_id.to_string()),
        };
        let result = lease.synthesize(&synthesis, &profile).await;

        if let Some(report) = self.lifecycle.release(lease) {
            debug!("Job {} released {} ({} bytes freed)", job_id, report.engine_id, report.freed_bytes);
        }
        result
    }

    async fn fall_back(
        &self,
        job: &mut Job,
        requested: &EngineDescriptor,
        profile_id: &str,
        request: &JobRequest,
        cause: TtsError,
    ) -> Result<SynthesisOutput> {
        let default = self.registry.get(&self.config.default_engine)?;
        let resolved = self
            .profile_map
            .resolve(&requested.id, profile_id, &default)
            .ok_or_else(|| TtsError::Internal {
                message: format!("default engine '{}' has no baseline profile", default.id),
                location: Some("JobOrchestrator::fall_back".to_string()),
            })?;

        let reason = format!(
            "{} unavailable: {}; served by {} with profile {}{}",
            requested.id,
            cause,
            default.id,
            resolved.profile_id,
            if resolved.mapped { "" } else { " (baseline)" }
        );
        warn!("Job {}: {}", job.id, reason);

        job.redirect(&default.id, &resolved.profile_id, reason);
        self.store.put(job)?;
        self.metrics.increment_counter(names::FALLBACKS, 1);

        self.run(
            &default,
            &resolved.profile_id,
            request,
            &job.id,
            self.config.acquire_timeout(),
        )
        .await
    }

    fn finish_completed(&self, mut job: Job, output: SynthesisOutput) -> Result<Submission> {
        let location = match &self.config.output_dir {
            Some(dir) => {
                let path = dir.join(format!("{}.wav", job.id));
                let written = std::fs::create_dir_all(dir)
                    .map_err(TtsError::from)
                    .and_then(|_| output.save_wav(&path));
                if let Err(e) = written {
                    return self.finish_failed(job, e);
                }
                Some(path)
            }
            None => None,
        };

        job.complete(AudioSummary::from(&output), location);
        self.store.put(&job)?;
        self.metrics.increment_counter(names::JOBS_COMPLETED, 1);
        info!(
            "Job {} completed on {} ({:.2}s of audio{})",
            job.id,
            job.used_engine_id.as_deref().unwrap_or_default(),
            output.duration,
            if job.fallback { ", fallback" } else { "" }
        );

        Ok(Submission {
            job,
            output: Some(output),
        })
    }

    fn finish_failed(&self, mut job: Job, err: TtsError) -> Result<Submission> {
        job.fail(&err);
        self.store.put(&job)?;
        self.metrics.increment_counter(names::JOBS_FAILED, 1);
        if matches!(err, TtsError::Timeout { .. }) {
            self.metrics.increment_counter(names::JOBS_TIMED_OUT, 1);
        }
        warn!("Job {} failed: {}", job.id, err);
        Ok(Submission { job, output: None })
    }
}

fn invalid(field: &str, message: impl Into<String>) -> TtsError {
    TtsError::Validation {
        message: message.into(),
        field: Some(field.to_string()),
    }
}

fn timeout_error(what: &str, limit: Duration) -> TtsError {
    TtsError::Timeout {
        message: format!("gave up {}", what),
        duration_ms: limit.as_millis() as u64,
    }
}
