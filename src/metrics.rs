/// Metrics Module - Prometheus Instrumentation
///
/// - Process-wide Prometheus registry
/// - Clean helper API used by the accumulator, executor and scheduler
/// - Labels limited to the command name (incrby, hincrby, sadd)
/// - Standard latency buckets

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use lazy_static::lazy_static;
use once_cell::sync::OnceCell;
use std::time::Instant;

/// Standard latency buckets for histograms (seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0];

static REGISTERED: OnceCell<()> = OnceCell::new();

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ========================================================================
    // 1. ACCUMULATION
    // ========================================================================

    /// Writes merged into a live generation
    /// Labels: command (incrby, hincrby, sadd)
    pub static ref WRITES_ACCUMULATED: IntCounterVec = IntCounterVec::new(
        Opts::new("redis_batch_writes_accumulated_total", "Writes merged into the live generation"),
        &["command"]
    ).unwrap();

    /// Entries in the generation detached by the last tick
    pub static ref DETACHED_ENTRIES: IntGauge = IntGauge::new(
        "redis_batch_detached_entries",
        "Entries in the generation detached by the last timer tick"
    ).unwrap();

    // ========================================================================
    // 2. FLUSHING
    // ========================================================================

    /// Generations flushed (non-empty)
    pub static ref FLUSHES: IntCounter = IntCounter::new(
        "redis_batch_flushes_total",
        "Non-empty generations flushed"
    ).unwrap();

    /// Timer ticks that found an empty generation
    pub static ref EMPTY_TICKS: IntCounter = IntCounter::new(
        "redis_batch_empty_ticks_total",
        "Timer ticks skipped because the generation was empty"
    ).unwrap();

    /// Flushes currently dispatching
    pub static ref FLUSHES_IN_FLIGHT: IntGauge = IntGauge::new(
        "redis_batch_flushes_in_flight",
        "Flushes currently dispatching commands"
    ).unwrap();

    /// Flush duration, dispatch of the first command to completion of the last
    pub static ref FLUSH_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("redis_batch_flush_duration_seconds", "Generation flush latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    // ========================================================================
    // 3. DISPATCH
    // ========================================================================

    /// Store commands dispatched
    /// Labels: command (incrby, hincrby, sadd)
    pub static ref COMMANDS_DISPATCHED: IntCounterVec = IntCounterVec::new(
        Opts::new("redis_batch_commands_dispatched_total", "Store commands dispatched"),
        &["command"]
    ).unwrap();

    /// Store commands that failed
    /// Labels: command (incrby, hincrby, sadd)
    pub static ref DISPATCH_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("redis_batch_dispatch_errors_total", "Store commands that returned an error"),
        &["command"]
    ).unwrap();
}

/// Register all metrics with the registry
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTERED
        .get_or_try_init(|| {
            REGISTRY.register(Box::new(WRITES_ACCUMULATED.clone()))?;
            REGISTRY.register(Box::new(DETACHED_ENTRIES.clone()))?;
            REGISTRY.register(Box::new(FLUSHES.clone()))?;
            REGISTRY.register(Box::new(EMPTY_TICKS.clone()))?;
            REGISTRY.register(Box::new(FLUSHES_IN_FLIGHT.clone()))?;
            REGISTRY.register(Box::new(FLUSH_DURATION.clone()))?;
            REGISTRY.register(Box::new(COMMANDS_DISPATCHED.clone()))?;
            REGISTRY.register(Box::new(DISPATCH_ERRORS.clone()))?;
            Ok::<(), prometheus::Error>(())
        })
        .map(|_| ())
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn increment_writes_accumulated(command: &str) {
    WRITES_ACCUMULATED.with_label_values(&[command]).inc();
}

pub fn set_detached_entries(count: usize) {
    DETACHED_ENTRIES.set(count as i64);
}

pub fn increment_empty_ticks() {
    EMPTY_TICKS.inc();
}

pub fn flush_started() {
    FLUSHES.inc();
    FLUSHES_IN_FLIGHT.inc();
}

pub fn flush_finished(duration_secs: f64) {
    FLUSHES_IN_FLIGHT.dec();
    FLUSH_DURATION.observe(duration_secs);
}

pub fn increment_commands_dispatched(command: &str) {
    COMMANDS_DISPATCHED.with_label_values(&[command]).inc();
}

pub fn increment_dispatch_errors(command: &str) {
    DISPATCH_ERRORS.with_label_values(&[command]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_twice() {
        init_metrics().unwrap();
        init_metrics().unwrap();
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().unwrap();

        increment_writes_accumulated("incrby");
        increment_commands_dispatched("sadd");
        increment_dispatch_errors("hincrby");
        set_detached_entries(3);

        let output = gather_metrics();

        assert!(output.contains("redis_batch_writes_accumulated_total"));
        assert!(output.contains("redis_batch_commands_dispatched_total"));
        assert!(output.contains("redis_batch_dispatch_errors_total"));
        assert!(output.contains("redis_batch_detached_entries"));
        assert!(!output.contains("redis_batch_pending_entries"));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let elapsed = timer.elapsed_secs();
        assert!(elapsed >= 0.01);
    }
}
