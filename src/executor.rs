/// Flush Executor - Turns one detached generation into store calls
///
/// One INCRBY per counter key, one HINCRBY per key/field, one SADD per set
/// key carrying every pending member. All calls of a generation are
/// dispatched concurrently and independently: a failed call is logged,
/// counted and reported to the observer, and the remaining calls still run.
/// Failed deltas are not merged back (at-most-once per flush).

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::generation::{Command, Generation};
use crate::metrics;
use crate::store::KeyValueStore;
use crate::telemetry::{truncate_key, truncate_list};

/// Flushes slower than this are logged at warn level
const SLOW_FLUSH_SECS: f64 = 10.0;

const LOG_KEY_LEN: usize = 64;
const LOG_MEMBERS_MAX: usize = 8;

/// Outcome of a single dispatched command
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub generation: u64,
    pub command: Command,
    /// Error text when the store rejected the call
    pub error: Option<String>,
    pub duration_ms: f64,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of one generation flush
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushReport {
    pub generation: u64,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: f64,
}

impl FlushReport {
    fn empty(generation: u64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dispatched == 0
    }
}

/// Hook receiving the outcome of every dispatched command
pub trait FlushObserver: Send + Sync {
    fn on_dispatch(&self, outcome: &DispatchOutcome);

    fn on_flush(&self, _report: &FlushReport) {}
}

/// Observer that ignores outcomes; logs and metrics still record them
pub struct NoopObserver;

impl FlushObserver for NoopObserver {
    fn on_dispatch(&self, _outcome: &DispatchOutcome) {}
}

/// Observer forwarding outcomes and reports to the embedding application
pub struct ChannelObserver {
    outcomes: mpsc::UnboundedSender<DispatchOutcome>,
    reports: Option<mpsc::UnboundedSender<FlushReport>>,
}

impl ChannelObserver {
    /// Forward every dispatch outcome
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DispatchOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { outcomes: tx, reports: None }, rx)
    }

    /// Forward dispatch outcomes and per-flush reports
    pub fn with_reports() -> (
        Self,
        mpsc::UnboundedReceiver<DispatchOutcome>,
        mpsc::UnboundedReceiver<FlushReport>,
    ) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let observer = Self {
            outcomes: outcome_tx,
            reports: Some(report_tx),
        };
        (observer, outcome_rx, report_rx)
    }
}

impl FlushObserver for ChannelObserver {
    fn on_dispatch(&self, outcome: &DispatchOutcome) {
        // receiver dropped: the application stopped listening
        let _ = self.outcomes.send(outcome.clone());
    }

    fn on_flush(&self, report: &FlushReport) {
        if let Some(reports) = &self.reports {
            let _ = reports.send(report.clone());
        }
    }
}

pub struct FlushExecutor {
    store: Arc<dyn KeyValueStore>,
    observer: Arc<dyn FlushObserver>,
}

impl FlushExecutor {
    pub fn new(store: Arc<dyn KeyValueStore>, observer: Arc<dyn FlushObserver>) -> Self {
        Self { store, observer }
    }

    /// Dispatch the minimal command set for `generation` and wait for all calls
    pub async fn execute(&self, generation: Generation) -> FlushReport {
        let id = generation.id();
        if generation.is_empty() {
            return FlushReport::empty(id);
        }

        let commands = generation.into_commands();
        let pending = commands.len();
        let timer = metrics::Timer::new();
        metrics::flush_started();

        debug!(generation = id, commands = pending, "Flush start");

        let outcomes = join_all(
            commands
                .into_iter()
                .map(|command| self.dispatch(id, command)),
        )
        .await;

        let elapsed_secs = timer.elapsed_secs();
        metrics::flush_finished(elapsed_secs);

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        let report = FlushReport {
            generation: id,
            dispatched: outcomes.len(),
            succeeded: outcomes.len() - failed,
            failed,
            duration_ms: elapsed_secs * 1000.0,
        };

        if failed > 0 {
            warn!(
                generation = id,
                dispatched = report.dispatched,
                failed = failed,
                "Flush completed with failures"
            );
        } else if elapsed_secs > SLOW_FLUSH_SECS {
            warn!(
                generation = id,
                dispatched = report.dispatched,
                duration_secs = elapsed_secs,
                "Slow flush"
            );
        } else {
            info!(
                generation = id,
                dispatched = report.dispatched,
                duration_ms = format!("{:.2}", report.duration_ms),
                "Flush complete"
            );
        }

        self.observer.on_flush(&report);
        report
    }

    async fn dispatch(&self, generation: u64, command: Command) -> DispatchOutcome {
        let timer = metrics::Timer::new();

        let result = match &command {
            Command::IncrBy { key, delta } => self.store.incr_by(key, *delta).await,
            Command::HIncrBy { key, field, delta } => self.store.hincr_by(key, field, *delta).await,
            Command::SAdd { key, members } => self.store.sadd(key, members).await,
        };
        metrics::increment_commands_dispatched(command.name());

        let error = match result {
            Ok(()) => {
                match &command {
                    Command::SAdd { key, members } => debug!(
                        generation = generation,
                        key = truncate_key(key, LOG_KEY_LEN),
                        members = truncate_list(members, LOG_MEMBERS_MAX),
                        "SADD dispatched"
                    ),
                    _ => debug!(
                        generation = generation,
                        command = %command,
                        "Command dispatched"
                    ),
                }
                None
            }
            Err(e) => {
                metrics::increment_dispatch_errors(command.name());
                error!(
                    generation = generation,
                    command = command.name(),
                    key = truncate_key(command.key(), LOG_KEY_LEN),
                    error = %e,
                    "Dispatch failed"
                );
                Some(e.to_string())
            }
        };

        let outcome = DispatchOutcome {
            generation,
            command,
            error,
            duration_ms: timer.elapsed_secs() * 1000.0,
        };
        self.observer.on_dispatch(&outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn generation_with_writes() -> Generation {
        let mut generation = Generation::new(3);
        generation.add_to_counter("key1", 1);
        generation.add_to_counter("key1", 1);
        generation.add_to_counter("key2", -40);
        generation.add_to_hash_counter("key1", "mobile", 1);
        generation.add_to_hash_counter("key1", "server", -40);
        generation.add_to_set("key1", "mobile");
        generation.add_to_set("key1", "mobile");
        generation.add_to_set("key1", "browser");
        generation
    }

    #[tokio::test]
    async fn test_empty_generation_dispatches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let executor = FlushExecutor::new(store.clone(), Arc::new(NoopObserver));

        let report = executor.execute(Generation::new(1)).await;

        assert!(report.is_empty());
        assert_eq!(report.generation, 1);
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_minimal_command_set() {
        let store = Arc::new(MemoryStore::new());
        let executor = FlushExecutor::new(store.clone(), Arc::new(NoopObserver));

        let report = executor.execute(generation_with_writes()).await;

        assert_eq!(report.generation, 3);
        assert_eq!(report.dispatched, 5);
        assert_eq!(report.succeeded, 5);
        assert_eq!(report.failed, 0);

        assert_eq!(
            store.calls_named("incrby"),
            vec![
                Command::IncrBy { key: "key1".into(), delta: 2 },
                Command::IncrBy { key: "key2".into(), delta: -40 },
            ]
        );
        assert_eq!(
            store.calls_named("hincrby"),
            vec![
                Command::HIncrBy { key: "key1".into(), field: "mobile".into(), delta: 1 },
                Command::HIncrBy { key: "key1".into(), field: "server".into(), delta: -40 },
            ]
        );
        assert_eq!(
            store.calls_named("sadd"),
            vec![Command::SAdd {
                key: "key1".into(),
                members: vec!["mobile".into(), "browser".into()],
            }]
        );
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_observed() {
        let store = Arc::new(MemoryStore::new());
        store.fail_key("key2");
        let (observer, mut outcomes, mut reports) = ChannelObserver::with_reports();
        let executor = FlushExecutor::new(store.clone(), Arc::new(observer));

        let report = executor.execute(generation_with_writes()).await;

        assert_eq!(report.dispatched, 5);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 4);

        // every other command still reached the store
        assert_eq!(store.counter("key1"), Some(2));
        assert_eq!(store.counter("key2"), None);
        assert_eq!(store.members("key1"), vec!["mobile", "browser"]);

        let mut seen = Vec::new();
        while let Ok(outcome) = outcomes.try_recv() {
            seen.push(outcome);
        }
        assert_eq!(seen.len(), 5);
        let failures: Vec<_> = seen.iter().filter(|o| !o.is_success()).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].command.key(), "key2");
        assert!(failures[0].error.as_deref().unwrap().contains("key2"));

        assert_eq!(reports.try_recv().unwrap(), report);
    }
}
