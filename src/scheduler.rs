/// Flush Scheduler - Repeating timer driving generation flushes
///
/// Each tick detaches the live generation and spawns its flush without
/// waiting for it, so a slow store never delays the next tick. Concurrent
/// flushes each own their generation and share nothing. The timer task and
/// every flush it spawns are tracked, so `stop` can wait for them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::accumulator::Accumulator;
use crate::error::{BatchError, Result};
use crate::executor::{FlushExecutor, FlushReport};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Constructed, timer not started
    Idle,
    /// Repeating timer active
    Armed,
    /// Timer cancelled
    Stopped,
}

/// What to do with the live generation when stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalFlush {
    /// Detach and flush it, waiting for every call to finish
    Flush,
    /// Drop it
    Discard,
}

pub struct FlushScheduler {
    accumulator: Arc<Accumulator>,
    executor: Arc<FlushExecutor>,
    period: Duration,
    state: Mutex<SchedulerState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl FlushScheduler {
    pub fn new(accumulator: Arc<Accumulator>, executor: Arc<FlushExecutor>, period: Duration) -> Self {
        Self {
            accumulator,
            executor,
            period,
            state: Mutex::new(SchedulerState::Idle),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SchedulerState {
        *self.lock_state()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Arm the repeating timer on the current Tokio runtime
    ///
    /// The first tick fires one full period after this call.
    pub fn start(&self) -> Result<()> {
        if self.period.is_zero() {
            return Err(BatchError::InvalidFlushInterval);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BatchError::NoRuntime)?;

        let mut state = self.lock_state();
        match *state {
            SchedulerState::Armed => {
                warn!("Flush timer already armed");
                return Ok(());
            }
            SchedulerState::Stopped => {
                warn!("Flush timer was stopped and cannot be re-armed");
                return Ok(());
            }
            SchedulerState::Idle => {}
        }

        self.tracker.spawn_on(
            run_timer(
                Arc::clone(&self.accumulator),
                Arc::clone(&self.executor),
                self.period,
                self.cancel.clone(),
                self.tracker.clone(),
            ),
            &runtime,
        );
        *state = SchedulerState::Armed;
        Ok(())
    }

    /// Detach the live generation and flush it now, waiting for the report
    ///
    /// Does not reset or disturb the timer.
    pub async fn flush_now(&self) -> FlushReport {
        let generation = self.accumulator.detach();
        self.executor.execute(generation).await
    }

    /// Cancel the timer, settle the live generation, then wait for every
    /// flush the timer already spawned to finish
    pub async fn stop(&self, final_flush: FinalFlush) -> Option<FlushReport> {
        self.cancel.cancel();
        let previous = std::mem::replace(&mut *self.lock_state(), SchedulerState::Stopped);
        if previous != SchedulerState::Stopped {
            info!(final_flush = ?final_flush, "Flush timer stopped");
        }

        let generation = self.accumulator.detach();
        let report = match final_flush {
            FinalFlush::Flush => Some(self.executor.execute(generation).await),
            FinalFlush::Discard => {
                if !generation.is_empty() {
                    warn!(
                        generation = generation.id(),
                        entries = generation.entry_count(),
                        "Discarding unflushed writes"
                    );
                }
                None
            }
        };

        self.tracker.close();
        if !self.tracker.is_empty() {
            debug!(in_flight = self.tracker.len(), "Waiting for in-flight flushes");
        }
        self.tracker.wait().await;
        report
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
        let pending = self.accumulator.pending_entries();
        if pending > 0 {
            warn!(
                entries = pending,
                state = ?self.state(),
                "Batch dropped with unflushed writes"
            );
        }
    }
}

async fn run_timer(
    accumulator: Arc<Accumulator>,
    executor: Arc<FlushExecutor>,
    period: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(period_ms = period.as_millis() as u64, "Flush timer armed");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Flush timer cancelled");
                break;
            }
            _ = ticker.tick() => {
                on_tick(&accumulator, &executor, &tracker);
            }
        }
    }
}

/// One tick: detach, skip if empty, otherwise spawn the flush on `tracker`
fn on_tick(
    accumulator: &Accumulator,
    executor: &Arc<FlushExecutor>,
    tracker: &TaskTracker,
) -> Option<JoinHandle<FlushReport>> {
    let generation = accumulator.detach();
    metrics::set_detached_entries(generation.entry_count());

    if generation.is_empty() {
        metrics::increment_empty_ticks();
        trace!(generation = generation.id(), "Empty generation, nothing to flush");
        return None;
    }

    let executor = Arc::clone(executor);
    Some(tracker.spawn(async move { executor.execute(generation).await }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ChannelObserver, NoopObserver};
    use crate::store::{KeyValueStore, MemoryStore, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::result::Result;

    const PERIOD: Duration = Duration::from_millis(10);

    fn scheduler(store: Arc<dyn KeyValueStore>) -> (Arc<Accumulator>, FlushScheduler) {
        let accumulator = Arc::new(Accumulator::new());
        let executor = Arc::new(FlushExecutor::new(store, Arc::new(NoopObserver)));
        let scheduler = FlushScheduler::new(Arc::clone(&accumulator), executor, PERIOD);
        (accumulator, scheduler)
    }

    /// Store that holds every call for `delay` before applying it
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl SlowStore {
        fn new(delay: Duration) -> Self {
            Self {
                inner: MemoryStore::new(),
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        async fn hold(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        fn in_flight(&self) -> usize {
            self.in_flight.load(Ordering::SeqCst)
        }

        fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeyValueStore for SlowStore {
        async fn incr_by(&self, key: &str, delta: i64) -> Result<(), StoreError> {
            self.hold().await;
            self.inner.incr_by(key, delta).await
        }

        async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<(), StoreError> {
            self.hold().await;
            self.inner.hincr_by(key, field, delta).await
        }

        async fn sadd(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
            self.hold().await;
            self.inner.sadd(key, members).await
        }
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let store = Arc::new(MemoryStore::new());
        let (_, scheduler) = scheduler(store.clone());

        assert!(matches!(scheduler.start(), Err(BatchError::NoRuntime)));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_arms_timer() {
        let store = Arc::new(MemoryStore::new());
        let (_, scheduler) = scheduler(store.clone());

        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.start().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Armed);
        // second start is a no-op
        scheduler.start().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_tick_skips_empty_generation() {
        let store = Arc::new(MemoryStore::new());
        let accumulator = Accumulator::new();
        let executor = Arc::new(FlushExecutor::new(store.clone(), Arc::new(NoopObserver)));
        let tracker = TaskTracker::new();

        assert!(on_tick(&accumulator, &executor, &tracker).is_none());
        assert!(tracker.is_empty());

        accumulator.add_to_counter("key1", 1);
        let report = on_tick(&accumulator, &executor, &tracker).unwrap().await.unwrap();
        assert_eq!(report.generation, 2);
        assert_eq!(report.dispatched, 1);
        assert_eq!(store.counter("key1"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_flushes_after_one_period() {
        let store = Arc::new(MemoryStore::new());
        let (accumulator, scheduler) = scheduler(store.clone());
        scheduler.start().unwrap();

        accumulator.add_to_counter("key1", 1);
        tokio::time::sleep(PERIOD / 2).await;
        assert_eq!(store.call_count(), 0);

        tokio::time::sleep(PERIOD).await;
        assert_eq!(store.call_count(), 1);
        assert_eq!(store.counter("key1"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer() {
        let store = Arc::new(MemoryStore::new());
        let (accumulator, scheduler) = scheduler(store.clone());
        scheduler.start().unwrap();

        assert!(scheduler.stop(FinalFlush::Discard).await.is_none());
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        accumulator.add_to_counter("key1", 1);
        tokio::time::sleep(PERIOD * 5).await;
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_with_final_flush() {
        let store = Arc::new(MemoryStore::new());
        let (accumulator, scheduler) = scheduler(store.clone());
        scheduler.start().unwrap();

        accumulator.add_to_set("key1", "mobile");
        let report = scheduler.stop(FinalFlush::Flush).await.unwrap();

        assert_eq!(report.dispatched, 1);
        assert_eq!(store.members("key1"), vec!["mobile"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_keep_firing_while_earlier_flushes_are_in_flight() {
        let store = Arc::new(SlowStore::new(PERIOD * 10));
        let (observer, mut outcomes) = ChannelObserver::new();
        let accumulator = Arc::new(Accumulator::new());
        let executor = Arc::new(FlushExecutor::new(store.clone(), Arc::new(observer)));
        let scheduler = FlushScheduler::new(Arc::clone(&accumulator), executor, PERIOD);
        scheduler.start().unwrap();

        // one write per period, each landing between two ticks
        tokio::time::sleep(PERIOD / 2).await;
        for key in ["key1", "key2", "key3"] {
            accumulator.add_to_counter(key, 1);
            tokio::time::sleep(PERIOD).await;
        }

        assert_eq!(store.in_flight(), 3);
        assert_eq!(store.max_in_flight(), 3);
        assert_eq!(store.inner.call_count(), 0);

        tokio::time::sleep(PERIOD * 20).await;
        assert_eq!(store.in_flight(), 0);

        let mut flushed = Vec::new();
        while let Ok(outcome) = outcomes.try_recv() {
            assert!(outcome.is_success());
            flushed.push((outcome.generation, outcome.command.key().to_string()));
        }
        flushed.sort();
        assert_eq!(
            flushed,
            vec![(1, "key1".to_string()), (2, "key2".to_string()), (3, "key3".to_string())]
        );
        for key in ["key1", "key2", "key3"] {
            assert_eq!(store.inner.counter(key), Some(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_flushes() {
        let store = Arc::new(SlowStore::new(PERIOD * 10));
        let (accumulator, scheduler) = scheduler(store.clone());
        scheduler.start().unwrap();

        accumulator.add_to_counter("key1", 1);
        tokio::time::sleep(PERIOD + PERIOD / 2).await;
        assert_eq!(store.in_flight(), 1);

        accumulator.add_to_counter("key2", 1);
        let report = scheduler.stop(FinalFlush::Flush).await.unwrap();

        assert_eq!(report.dispatched, 1);
        assert_eq!(store.in_flight(), 0);
        assert_eq!(store.inner.counter("key1"), Some(1));
        assert_eq!(store.inner.counter("key2"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discarding_stop_still_waits_for_in_flight_flushes() {
        let store = Arc::new(SlowStore::new(PERIOD * 10));
        let (accumulator, scheduler) = scheduler(store.clone());
        scheduler.start().unwrap();

        accumulator.add_to_counter("key1", 1);
        tokio::time::sleep(PERIOD + PERIOD / 2).await;
        accumulator.add_to_counter("key2", 1);

        assert!(scheduler.stop(FinalFlush::Discard).await.is_none());
        assert_eq!(store.in_flight(), 0);
        assert_eq!(store.inner.counter("key1"), Some(1));
        assert_eq!(store.inner.counter("key2"), None);
    }
}
