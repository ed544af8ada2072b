//! Control-plane metrics
//!
//! Lock-free counters, gauges and timers shared by the lifecycle manager,
//! the orchestrator and the checkpoint manager. Cloning a collector yields a
//! handle onto the same underlying maps.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

/// Well-known metric names
pub mod names {
    pub const ENGINE_LOADS: &str = "lifecycle.loads";
    pub const ENGINE_LOAD_FAILURES: &str = "lifecycle.load_failures";
    pub const STRATEGY_FAILURES: &str = "lifecycle.strategy_failures";
    pub const EVICTIONS: &str = "lifecycle.evictions";
    pub const EVICTION_FAILURES: &str = "lifecycle.eviction_failures";
    pub const BYTES_FREED: &str = "lifecycle.bytes_freed";
    pub const RESIDENT_BYTES: &str = "lifecycle.resident_bytes";
    pub const LOAD_TIME: &str = "lifecycle.load";
    pub const ACQUIRE_WAIT: &str = "lifecycle.acquire_wait";

    pub const JOBS_SUBMITTED: &str = "jobs.submitted";
    pub const JOBS_COMPLETED: &str = "jobs.completed";
    pub const JOBS_FAILED: &str = "jobs.failed";
    pub const JOBS_REJECTED: &str = "jobs.rejected";
    pub const JOBS_TIMED_OUT: &str = "jobs.timed_out";
    pub const FALLBACKS: &str = "jobs.fallbacks";
    pub const EXECUTE_TIME: &str = "jobs.execute";

    pub const CHECKPOINTS_WRITTEN: &str = "training.checkpoints";
    pub const LATEST_WRITTEN: &str = "training.latest";
    pub const CHECKPOINTS_PRUNED: &str = "training.pruned";
    pub const SAMPLES_WRITTEN: &str = "training.samples";
    pub const SAMPLING_FAILURES: &str = "training.sampling_failures";
}

/// Accumulated durations for one timer
#[derive(Debug, Clone)]
pub struct TimerStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
    pub last: Duration,
}

impl Default for TimerStats {
    fn default() -> Self {
        Self {
            count: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
            last: Duration::ZERO,
        }
    }
}

impl TimerStats {
    fn observe(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.min = self.min.min(elapsed);
        self.max = self.max.max(elapsed);
        self.last = elapsed;
    }

    pub fn mean_ms(&self) -> f64 {
        match self.count {
            0 => 0.0,
            n => self.total.as_secs_f64() * 1000.0 / n as f64,
        }
    }
}

/// Metrics collector for tracking control-plane activity
#[derive(Clone, Default)]
pub struct MetricsCollector {
    timers: Arc<DashMap<String, TimerStats>>,
    counters: Arc<DashMap<String, AtomicU64>>,
    gauges: Arc<DashMap<String, f64>>,
}

/// Timing guard; records into its collector when stopped or dropped
pub struct TimingInfo {
    name: String,
    start: Instant,
    collector: MetricsCollector,
    recorded: bool,
}

impl TimingInfo {
    /// Stop timing and record
    pub fn stop(mut self) -> Duration {
        let duration = self.start.elapsed();
        self.collector.record_timer(&self.name, duration);
        self.recorded = true;
        duration
    }
}

impl Drop for TimingInfo {
    fn drop(&mut self) {
        if !self.recorded {
            self.collector
                .record_timer(&self.name, self.start.elapsed());
        }
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing an operation
    pub fn start_timer(&self, name: impl Into<String>) -> TimingInfo {
        TimingInfo {
            name: name.into(),
            start: Instant::now(),
            collector: self.clone(),
            recorded: false,
        }
    }

    pub fn record_timer(&self, name: &str, duration: Duration) {
        self.timers
            .entry(name.to_string())
            .or_default()
            .observe(duration);
    }

    pub fn increment_counter(&self, name: &str, value: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.insert(name.to_string(), value);
    }

    pub fn get_timer(&self, name: &str) -> Option<TimerStats> {
        self.timers.get(name).map(|r| r.value().clone())
    }

    pub fn get_counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn get_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|r| *r)
    }

    /// Generate a summary report, sorted by metric name
    pub fn report(&self) -> MetricsReport {
        let mut report = MetricsReport::default();

        for r in self.timers.iter() {
            let stats = r.value();
            report.timers.push(TimerReport {
                name: r.key().clone(),
                count: stats.count,
                avg_ms: stats.mean_ms(),
                min_ms: stats.min.as_secs_f64() * 1000.0,
                max_ms: stats.max.as_secs_f64() * 1000.0,
            });
        }
        for r in self.counters.iter() {
            report
                .counters
                .push((r.key().clone(), r.value().load(Ordering::Relaxed)));
        }
        for r in self.gauges.iter() {
            report.gauges.push((r.key().clone(), *r.value()));
        }

        report.timers.sort_by(|a, b| a.name.cmp(&b.name));
        report.counters.sort_by(|a, b| a.0.cmp(&b.0));
        report.gauges.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimerReport {
    pub name: String,
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// Point-in-time snapshot, every section sorted by name
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsReport {
    pub timers: Vec<TimerReport>,
    pub counters: Vec<(String, u64)>,
    pub gauges: Vec<(String, f64)>,
}

impl fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for t in &self.timers {
            writeln!(
                f,
                "timer {}: n={} avg={:.2}ms min={:.2}ms max={:.2}ms",
                t.name, t.count, t.avg_ms, t.min_ms, t.max_ms
            )?;
        }
        for (name, value) in &self.counters {
            writeln!(f, "counter {}: {}", name, value)?;
        }
        for (name, value) in &self.gauges {
            writeln!(f, "gauge {}: {:.2}", name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_stats() {
        let mut stats = TimerStats::default();

        assert_eq!(stats.mean_ms(), 0.0);

        stats.observe(Duration::from_millis(100));
        stats.observe(Duration::from_millis(200));
        stats.observe(Duration::from_millis(150));

        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, Duration::from_millis(100));
        assert_eq!(stats.max, Duration::from_millis(200));
        assert_eq!(stats.last, Duration::from_millis(150));
        assert!((stats.mean_ms() - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_clones_share_state() {
        let collector = MetricsCollector::new();
        let other = collector.clone();

        other.increment_counter(names::FALLBACKS, 2);
        collector.increment_counter(names::FALLBACKS, 1);
        assert_eq!(collector.get_counter(names::FALLBACKS), 3);

        collector.set_gauge(names::RESIDENT_BYTES, 1024.0);
        assert_eq!(other.get_gauge(names::RESIDENT_BYTES), Some(1024.0));
    }

    #[test]
    fn test_timer_guard_records_once() {
        let collector = MetricsCollector::new();
        let timer = collector.start_timer(names::LOAD_TIME);
        timer.stop();
        {
            let _guard = collector.start_timer(names::LOAD_TIME);
        }
        assert_eq!(collector.get_timer(names::LOAD_TIME).unwrap().count, 2);
    }

    #[test]
    fn test_metrics_report() {
        let collector = MetricsCollector::new();
        collector.record_timer("op", Duration::from_millis(100));
        collector.increment_counter("count", 5);
        collector.set_gauge("gauge", 42.0);

        let report = collector.report();
        assert_eq!(report.counters, vec![("count".to_string(), 5)]);

        let text = report.to_string();
        assert!(text.contains("timer op: n=1"));
        assert!(text.contains("counter count: 5"));
        assert!(text.contains("gauge gauge: 42.00"));
    }
}
