//! Batch Facade - Public entry point
//!
//! ```rust,ignore
//! let store = Arc::new(MemoryStore::new());
//! let batch = RedisBatch::builder()
//!     .client(store.clone())
//!     .flush_after(Duration::from_millis(250))
//!     .build()?;
//!
//! batch.incr("visits")
//!     .hincrby("visits:by-client", "mobile", 2)
//!     .sadd("clients", "mobile");
//! ```

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::accumulator::Accumulator;
use crate::config::BatchOptions;
use crate::error::{BatchError, Result};
use crate::executor::{FlushExecutor, FlushObserver, FlushReport, NoopObserver};
use crate::metrics;
use crate::scheduler::{FinalFlush, FlushScheduler, SchedulerState};
use crate::store::KeyValueStore;

/// Write-coalescing buffer in front of a key-value store
pub struct RedisBatch {
    accumulator: Arc<Accumulator>,
    scheduler: FlushScheduler,
    options: BatchOptions,
}

#[derive(Default)]
pub struct RedisBatchBuilder {
    client: Option<Arc<dyn KeyValueStore>>,
    options: BatchOptions,
    observer: Option<Arc<dyn FlushObserver>>,
}

impl RedisBatchBuilder {
    /// Store client every flush dispatches to (required)
    pub fn client(mut self, client: Arc<dyn KeyValueStore>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn flush_after(mut self, flush_after: Duration) -> Self {
        self.options = BatchOptions::with_flush_after(flush_after);
        self
    }

    /// Hook receiving every dispatch outcome and flush report
    pub fn observer(mut self, observer: Arc<dyn FlushObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the batch and arm its flush timer
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<RedisBatch> {
        let client = self.client.ok_or(BatchError::MissingClient)?;
        self.options.validate()?;

        if let Err(e) = metrics::init_metrics() {
            warn!(error = %e, "Metrics registration failed");
        }

        let observer = self.observer.unwrap_or_else(|| Arc::new(NoopObserver));
        let accumulator = Arc::new(Accumulator::new());
        let executor = Arc::new(FlushExecutor::new(client, observer));
        let scheduler = FlushScheduler::new(
            Arc::clone(&accumulator),
            executor,
            self.options.flush_after(),
        );
        scheduler.start()?;

        info!(flush_after_ms = self.options.flush_after_ms, "Batch ready");

        Ok(RedisBatch {
            accumulator,
            scheduler,
            options: self.options,
        })
    }
}

impl RedisBatch {
    pub fn builder() -> RedisBatchBuilder {
        RedisBatchBuilder::default()
    }

    pub fn new(client: Arc<dyn KeyValueStore>, options: BatchOptions) -> Result<Self> {
        Self::builder().client(client).options(options).build()
    }

    /// INCRBY key 1
    pub fn incr(&self, key: &str) -> &Self {
        self.incrby(key, 1)
    }

    /// INCRBY key delta
    pub fn incrby(&self, key: &str, delta: i64) -> &Self {
        self.accumulator.add_to_counter(key, delta);
        self
    }

    /// HINCRBY key field 1
    pub fn hincr(&self, key: &str, field: &str) -> &Self {
        self.hincrby(key, field, 1)
    }

    /// HINCRBY key field delta
    pub fn hincrby(&self, key: &str, field: &str, delta: i64) -> &Self {
        self.accumulator.add_to_hash_counter(key, field, delta);
        self
    }

    /// SADD key member
    pub fn sadd(&self, key: &str, member: &str) -> &Self {
        self.accumulator.add_to_set(key, member);
        self
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn pending_entries(&self) -> usize {
        self.accumulator.pending_entries()
    }

    /// Flush the live generation immediately and wait for every call
    pub async fn flush_now(&self) -> FlushReport {
        self.scheduler.flush_now().await
    }

    /// Cancel the flush timer, optionally flushing what is still pending
    pub async fn stop(&self, final_flush: FinalFlush) -> Option<FlushReport> {
        self.scheduler.stop(final_flush).await
    }

    #[cfg(test)]
    pub(crate) fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }
}
