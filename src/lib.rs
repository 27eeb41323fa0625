pub mod accumulator;
pub mod batch;
pub mod config;
pub mod error;
pub mod executor;
pub mod generation;
pub mod merge;
pub mod metrics;
pub mod scheduler;
pub mod store;
pub mod telemetry;


pub use batch::{RedisBatch, RedisBatchBuilder};
pub use crate::config::{BatchOptions, Settings};
pub use error::BatchError;
pub use executor::{ChannelObserver, DispatchOutcome, FlushObserver, FlushReport, NoopObserver};
pub use generation::{Command, Generation};
pub use scheduler::{FinalFlush, SchedulerState};
pub use store::{KeyValueStore, MemoryStore, StoreError};
