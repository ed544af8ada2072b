//! Model lifecycle manager
//!
//! Decides which engines occupy the accelerator. Loading walks the
//! descriptor's strategies in order; callers get [`Lease`]s; eviction runs
//! the sequence in [`super::eviction`] and reports what it freed.
//!
//! In constrained mode a single engine may be resident and it is evicted as
//! soon as its last lease is released. Otherwise up to `max_resident` engines
//! stay warm and the least recently used idle one makes room when needed.
//! Either way an acquire that finds every slot leased waits for a release.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::core::config::LifecycleConfig;
use crate::core::error::{Result, StrategyFailure, TtsError};
use crate::core::metrics::{names, MetricsCollector};
use crate::engine::{EngineDescriptor, EngineRegistry, LoadContext, SynthesisEngine};
use super::eviction::{evict_engine, AcceleratorProbe, CandleProbe, EvictionReport};
use super::handle::{HandleInfo, Lease, ModelHandle};

/// Eviction failures kept for health reporting
const FAILURE_HISTORY: usize = 16;

/// A recorded incomplete eviction
#[derive(Debug, Clone, Serialize)]
pub struct EvictionFailure {
    pub engine_id: String,
    pub message: String,
    pub failed_components: Vec<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Available,
    Unavailable,
}

/// Live availability of one registered engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub engine_id: String,
    pub status: EngineStatus,
    pub resident: bool,
    /// Strategy that loaded it, or whose preflight passed
    pub strategy: Option<String>,
    /// Why every strategy's preflight failed
    pub detail: Option<String>,
    /// Error from the most recent failed load, if any
    pub last_load_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub engines: Vec<EngineHealth>,
    pub resident: Vec<HandleInfo>,
    pub eviction_failures: Vec<EvictionFailure>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn engine(&self, engine_id: &str) -> Option<&EngineHealth> {
        self.engines.iter().find(|e| e.engine_id == engine_id)
    }

    pub fn is_available(&self, engine_id: &str) -> bool {
        self.engine(engine_id)
            .map(|e| e.status == EngineStatus::Available)
            .unwrap_or(false)
    }
}

#[derive(Default)]
struct Residency {
    handles: HashMap<String, ModelHandle>,
    /// Engines whose load is in flight; each holds a resident slot
    loading: HashSet<String>,
    eviction_failures: VecDeque<EvictionFailure>,
    load_failures: HashMap<String, String>,
}

impl Residency {
    fn occupied(&self) -> usize {
        self.handles.len() + self.loading.len()
    }
}

enum Attempt {
    Leased(Lease),
    Reserved(Reservation),
    Busy(Vec<String>),
}

/// A slot held for a load running off the async thread.
///
/// Dropped without [`LifecycleInner::complete_load`] (the acquiring future
/// was cancelled) it frees the slot and wakes waiters.
struct Reservation {
    inner: Arc<LifecycleInner>,
    engine_id: String,
    armed: bool,
}

impl Reservation {
    fn settle(&mut self, state: &mut Residency) {
        state.loading.remove(&self.engine_id);
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!("Load of {} abandoned; freeing its slot", self.engine_id);
        if let Ok(mut state) = self.inner.state.lock() {
            state.loading.remove(&self.engine_id);
        }
        self.inner.released.notify_waiters();
    }
}

pub(crate) struct LifecycleInner {
    registry: Arc<EngineRegistry>,
    config: LifecycleConfig,
    probe: Arc<dyn AcceleratorProbe>,
    metrics: MetricsCollector,
    state: Mutex<Residency>,
    released: Notify,
    next_lease: AtomicU64,
}

impl LifecycleInner {
    fn lock(&self, location: &str) -> Result<std::sync::MutexGuard<'_, Residency>> {
        self.state
            .lock()
            .map_err(|_| TtsError::lock_poisoned(location))
    }

    fn load_context<'a>(&'a self, descriptor: &'a EngineDescriptor) -> LoadContext<'a> {
        LoadContext {
            descriptor,
            placement: self.config.placement(),
            models_dir: &self.config.models_dir,
        }
    }

    /// Try each strategy in order
    fn load(&self, descriptor: &EngineDescriptor) -> Result<(Box<dyn SynthesisEngine>, String)> {
        let timer = self.metrics.start_timer(names::LOAD_TIME);
        let ctx = self.load_context(descriptor);
        let mut attempts = Vec::new();

        for strategy in &descriptor.load_strategies {
            match strategy.load(&ctx) {
                Ok(engine) => {
                    let elapsed = timer.stop();
                    self.metrics.increment_counter(names::ENGINE_LOADS, 1);
                    info!(
                        "Loaded {} via {} strategy on {} in {:.2}s",
                        descriptor.id,
                        strategy.name(),
                        ctx.placement,
                        elapsed.as_secs_f32()
                    );
                    return Ok((engine, strategy.name().to_string()));
                }
                Err(e) => {
                    warn!("Load strategy {} failed for {}: {}", strategy.name(), descriptor.id, e);
                    self.metrics.increment_counter(names::STRATEGY_FAILURES, 1);
                    attempts.push(StrategyFailure {
                        strategy: strategy.name().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        self.metrics.increment_counter(names::ENGINE_LOAD_FAILURES, 1);
        error!("All load strategies failed for {}", descriptor.id);
        Err(TtsError::EngineLoad {
            engine_id: descriptor.id.clone(),
            attempts,
        })
    }

    fn try_acquire(self: &Arc<Self>, descriptor: &Arc<EngineDescriptor>) -> Result<Attempt> {
        let mut state = self.lock("ModelLifecycleManager::acquire")?;

        if let Some(handle) = state.handles.get_mut(&descriptor.id) {
            handle.leases += 1;
            handle.last_used = Instant::now();
            let lease = Lease::new(self.next_lease.fetch_add(1, Ordering::Relaxed), handle, Arc::clone(self));
            debug!("Lease {} on resident {}", lease.id(), descriptor.id);
            return Ok(Attempt::Leased(lease));
        }
        if state.loading.contains(&descriptor.id) {
            return Ok(Attempt::Busy(vec![descriptor.id.clone()]));
        }

        let limit = self.config.resident_limit();
        while state.occupied() >= limit {
            let victim = state
                .handles
                .values()
                .filter(|h| h.leases == 0)
                .min_by_key(|h| h.last_used)
                .map(|h| h.descriptor.id.clone());

            match victim.and_then(|id| state.handles.remove(&id)) {
                Some(handle) => {
                    info!(
                        "Evicting idle {} to make room for {}",
                        handle.descriptor.id, descriptor.id
                    );
                    self.finish_eviction(&mut state, handle);
                }
                None => {
                    let holders = state
                        .handles
                        .keys()
                        .chain(state.loading.iter())
                        .cloned()
                        .collect();
                    return Ok(Attempt::Busy(holders));
                }
            }
        }

        state.loading.insert(descriptor.id.clone());
        Ok(Attempt::Reserved(Reservation {
            inner: Arc::clone(self),
            engine_id: descriptor.id.clone(),
            armed: true,
        }))
    }

    /// Turn a finished load into a resident handle, or record its failure
    fn complete_load(
        self: &Arc<Self>,
        mut reservation: Reservation,
        descriptor: &Arc<EngineDescriptor>,
        loaded: Result<(Box<dyn SynthesisEngine>, String)>,
    ) -> Result<Lease> {
        let result = {
            let mut state = self.lock("ModelLifecycleManager::complete_load")?;
            reservation.settle(&mut state);
            match loaded {
                Ok((engine, strategy)) => {
                    state.load_failures.remove(&descriptor.id);
                    let mut handle = ModelHandle::new(Arc::clone(descriptor), engine, strategy);
                    handle.leases = 1;
                    let lease =
                        Lease::new(self.next_lease.fetch_add(1, Ordering::Relaxed), &handle, Arc::clone(self));
                    state.handles.insert(descriptor.id.clone(), handle);
                    self.update_gauges(&state);
                    Ok(lease)
                }
                Err(e) => {
                    state.load_failures.insert(descriptor.id.clone(), e.to_string());
                    Err(e)
                }
            }
        };

        self.released.notify_waiters();
        result
    }

    pub(crate) fn release_lease(&self, engine_id: &str, lease_id: u64) -> Option<EvictionReport> {
        let report = match self.state.lock() {
            Ok(mut state) => match state.handles.get_mut(engine_id) {
                Some(handle) => {
                    handle.leases = handle.leases.saturating_sub(1);
                    handle.last_used = Instant::now();
                    debug!("Released lease {} on {} ({} left)", lease_id, engine_id, handle.leases);

                    if handle.leases == 0 && self.config.constrained {
                        state
                            .handles
                            .remove(engine_id)
                            .map(|handle| self.finish_eviction(&mut state, handle))
                    } else {
                        None
                    }
                }
                None => {
                    warn!("Lease {} released for non-resident engine {}", lease_id, engine_id);
                    None
                }
            },
            Err(_) => {
                error!("Lifecycle state poisoned; lease {} on {} not released", lease_id, engine_id);
                None
            }
        };

        self.released.notify_waiters();
        report
    }

    /// Run eviction on a handle already removed from the resident set.
    ///
    /// The handle is dropped afterwards whatever the outcome; an incomplete
    /// eviction is recorded for health reporting.
    fn finish_eviction(&self, state: &mut Residency, handle: ModelHandle) -> EvictionReport {
        let engine_id = handle.descriptor.id.clone();
        let report = match handle.engine.try_write() {
            Ok(mut engine) => evict_engine(&handle.descriptor, &mut **engine, self.probe.as_ref()),
            Err(_) => {
                let mut report = EvictionReport::not_resident(&engine_id);
                report.was_resident = true;
                report.before = handle.footprint;
                report.after = handle.footprint;
                report
                    .failed
                    .push(("<engine>".to_string(), "engine is still executing".to_string()));
                report
            }
        };

        self.metrics.increment_counter(names::EVICTIONS, 1);
        self.metrics
            .increment_counter(names::BYTES_FREED, report.freed_bytes);

        if let Some(TtsError::Eviction {
            message, failed, ..
        }) = report.to_error()
        {
            warn!("Eviction of {} incomplete: {}", engine_id, message);
            self.metrics.increment_counter(names::EVICTION_FAILURES, 1);
            if state.eviction_failures.len() == FAILURE_HISTORY {
                state.eviction_failures.pop_front();
            }
            state.eviction_failures.push_back(EvictionFailure {
                engine_id: engine_id.clone(),
                message,
                failed_components: failed,
                at: Utc::now(),
            });
        } else {
            info!("Evicted {} ({} bytes freed)", engine_id, report.freed_bytes);
        }

        drop(handle);
        self.update_gauges(state);
        report
    }

    fn update_gauges(&self, state: &Residency) {
        let bytes: u64 = state
            .handles
            .values()
            .map(|h| h.footprint.accelerator_bytes)
            .sum();
        self.metrics.set_gauge(names::RESIDENT_BYTES, bytes as f64);
    }
}

/// Owner of every resident engine
#[derive(Clone)]
pub struct ModelLifecycleManager {
    inner: Arc<LifecycleInner>,
}

/// Builder for [`ModelLifecycleManager`]
pub struct LifecycleBuilder {
    registry: Arc<EngineRegistry>,
    config: LifecycleConfig,
    probe: Option<Arc<dyn AcceleratorProbe>>,
    metrics: Option<MetricsCollector>,
}

impl LifecycleBuilder {
    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn probe(mut self, probe: Arc<dyn AcceleratorProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> ModelLifecycleManager {
        ModelLifecycleManager {
            inner: Arc::new(LifecycleInner {
                registry: self.registry,
                config: self.config,
                probe: self.probe.unwrap_or_else(|| Arc::new(CandleProbe)),
                metrics: self.metrics.unwrap_or_default(),
                state: Mutex::new(Residency::default()),
                released: Notify::new(),
                next_lease: AtomicU64::new(1),
            }),
        }
    }
}

impl ModelLifecycleManager {
    pub fn new(registry: Arc<EngineRegistry>, config: LifecycleConfig) -> Self {
        Self::builder(registry).config(config).build()
    }

    pub fn builder(registry: Arc<EngineRegistry>) -> LifecycleBuilder {
        LifecycleBuilder {
            registry,
            config: LifecycleConfig::default(),
            probe: None,
            metrics: None,
        }
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    /// Lease a registered engine, loading it if needed
    pub async fn acquire(&self, engine_id: &str) -> Result<Lease> {
        let descriptor = self.inner.registry.get(engine_id)?;
        self.acquire_descriptor(descriptor).await
    }

    /// Lease an engine described by `descriptor`, registered or not.
    ///
    /// Waits while every resident slot is leased or loading. Weights are read
    /// on the blocking pool with the slot reserved, so the state lock is never
    /// held across a load. Cancel-safe: a dropped future frees its slot, and
    /// an engine whose load finishes after cancellation is discarded.
    pub async fn acquire_descriptor(&self, descriptor: Arc<EngineDescriptor>) -> Result<Lease> {
        let _wait = self.inner.metrics.start_timer(names::ACQUIRE_WAIT);
        let mut announced = false;

        loop {
            let released = self.inner.released.notified();
            match self.inner.try_acquire(&descriptor)? {
                Attempt::Leased(lease) => return Ok(lease),
                Attempt::Reserved(reservation) => {
                    let inner = Arc::clone(&self.inner);
                    let target = Arc::clone(&descriptor);
                    let loaded = tokio::task::spawn_blocking(move || inner.load(&target))
                        .await
                        .map_err(|e| TtsError::Internal {
                            message: format!("load task for {} failed: {}", descriptor.id, e),
                            location: Some("ModelLifecycleManager::acquire".to_string()),
                        })
                        .and_then(|loaded| loaded);
                    return self.inner.complete_load(reservation, &descriptor, loaded);
                }
                Attempt::Busy(holders) => {
                    if !announced {
                        info!("{} waiting for {:?} to be released", descriptor.id, holders);
                        announced = true;
                    }
                    released.await;
                }
            }
        }
    }

    /// Give a lease back. Returns the eviction report when this release
    /// evicted the engine.
    pub fn release(&self, lease: Lease) -> Option<EvictionReport> {
        lease.release()
    }

    /// Force reclamation of an idle engine.
    ///
    /// Not resident: zero-freed report. Leased: `Eviction` error, nothing
    /// touched. Incomplete reclamation: `Eviction` error; the handle is
    /// dropped regardless.
    pub fn evict(&self, engine_id: &str) -> Result<EvictionReport> {
        let result = {
            let mut state = self.inner.lock("ModelLifecycleManager::evict")?;
            let leases = state.handles.get(engine_id).map(|h| h.leases);
            match leases {
                None => {
                    debug!("{} is not resident; nothing to evict", engine_id);
                    Ok(EvictionReport::not_resident(engine_id))
                }
                Some(n) if n > 0 => Err(TtsError::Eviction {
                    engine_id: engine_id.to_string(),
                    message: format!("{} lease(s) outstanding", n),
                    relocated: Vec::new(),
                    failed: Vec::new(),
                }),
                Some(_) => match state.handles.remove(engine_id) {
                    Some(handle) => {
                        let report = self.inner.finish_eviction(&mut state, handle);
                        match report.to_error() {
                            Some(e) => Err(e),
                            None => Ok(report),
                        }
                    }
                    None => Ok(EvictionReport::not_resident(engine_id)),
                },
            }
        };

        self.inner.released.notify_waiters();
        result
    }

    /// Evict every idle engine; leased ones are left in place
    pub fn shutdown(&self) -> Result<Vec<EvictionReport>> {
        let reports = {
            let mut state = self.inner.lock("ModelLifecycleManager::shutdown")?;
            let idle: Vec<String> = state
                .handles
                .values()
                .filter(|h| h.leases == 0)
                .map(|h| h.descriptor.id.clone())
                .collect();
            for handle in state.handles.values().filter(|h| h.leases > 0) {
                warn!("{} still leased at shutdown", handle.descriptor.id);
            }

            let mut reports = Vec::new();
            for id in idle {
                if let Some(handle) = state.handles.remove(&id) {
                    reports.push(self.inner.finish_eviction(&mut state, handle));
                }
            }
            reports
        };

        self.inner.released.notify_waiters();
        Ok(reports)
    }

    pub fn resident(&self) -> Result<Vec<HandleInfo>> {
        let state = self.inner.lock("ModelLifecycleManager::resident")?;
        let mut list: Vec<_> = state.handles.values().map(ModelHandle::info).collect();
        list.sort_by(|a, b| a.engine_id.cmp(&b.engine_id));
        Ok(list)
    }

    pub fn is_resident(&self, engine_id: &str) -> bool {
        self.inner
            .lock("ModelLifecycleManager::is_resident")
            .map(|s| s.handles.contains_key(engine_id))
            .unwrap_or(false)
    }

    /// Live availability of every registered engine.
    ///
    /// Resident engines are available. For the rest each strategy's preflight
    /// runs now; the first one passing makes the engine available.
    pub fn health(&self) -> Result<HealthReport> {
        let (resident, eviction_failures, load_failures) = {
            let state = self.inner.lock("ModelLifecycleManager::health")?;
            (
                state
                    .handles
                    .values()
                    .map(|h| (h.descriptor.id.clone(), h.info()))
                    .collect::<HashMap<_, _>>(),
                state.eviction_failures.iter().cloned().collect::<Vec<_>>(),
                state.load_failures.clone(),
            )
        };

        let mut engines = Vec::new();
        for descriptor in self.inner.registry.list()? {
            let last_load_error = load_failures.get(&descriptor.id).cloned();

            if let Some(info) = resident.get(&descriptor.id) {
                engines.push(EngineHealth {
                    engine_id: descriptor.id.clone(),
                    status: EngineStatus::Available,
                    resident: true,
                    strategy: Some(info.strategy.clone()),
                    detail: None,
                    last_load_error,
                });
                continue;
            }

            let ctx = self.inner.load_context(&descriptor);
            let mut errors = Vec::new();
            let mut passing = None;
            for strategy in &descriptor.load_strategies {
                match strategy.check(&ctx) {
                    Ok(()) => {
                        passing = Some(strategy.name().to_string());
                        break;
                    }
                    Err(e) => errors.push(format!("{}: {}", strategy.name(), e)),
                }
            }

            let available = passing.is_some();
            engines.push(EngineHealth {
                engine_id: descriptor.id.clone(),
                status: if available {
                    EngineStatus::Available
                } else {
                    EngineStatus::Unavailable
                },
                resident: false,
                strategy: passing,
                detail: if available {
                    None
                } else if errors.is_empty() {
                    Some("no load strategies declared".to_string())
                } else {
                    Some(errors.join("; "))
                },
                last_load_error,
            });
        }

        let mut resident: Vec<_> = resident.into_values().collect();
        resident.sort_by(|a, b| a.engine_id.cmp(&b.engine_id));

        Ok(HealthReport {
            engines,
            resident,
            eviction_failures,
            checked_at: Utc::now(),
        })
    }
}
