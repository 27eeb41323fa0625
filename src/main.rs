//! redis-batch load driver
//!
//! Drives a synthetic write load through a batch backed by the in-process
//! store, then prints what reached the store.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release -- --writes 50000 --keys 32 --flush-after-ms 250
//! cargo run --release -- --config batch.toml --fail-key demo:counter:3 --metrics
//! ```

use clap::Parser;
use redis_batch::{metrics, telemetry, ChannelObserver, FinalFlush, MemoryStore, RedisBatch, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const CLIENTS: [&str; 3] = ["mobile", "server", "browser"];
const WRITES_PER_CHUNK: u64 = 100;

#[derive(Parser, Debug)]
#[clap(name = "redis-batch")]
#[clap(about = "Drive a synthetic write load through a coalescing batch", long_about = None)]
struct Args {
    /// Settings file (TOML); REDIS_BATCH__* environment variables override it
    #[clap(long)]
    config: Option<PathBuf>,

    /// Flush period in milliseconds (overrides settings)
    #[clap(long)]
    flush_after_ms: Option<u64>,

    /// Total writes to issue
    #[clap(long, default_value_t = 10_000)]
    writes: u64,

    /// Distinct counter keys the writes are spread over
    #[clap(long, default_value_t = 16)]
    keys: u64,

    /// Time over which the writes are spread
    #[clap(long, default_value_t = 3)]
    duration_secs: u64,

    /// Keys the store rejects (repeatable)
    #[clap(long)]
    fail_key: Vec<String>,

    /// Print Prometheus metrics after the run
    #[clap(long, default_value_t = false)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(flush_after_ms) = args.flush_after_ms {
        settings.batch.flush_after_ms = flush_after_ms;
    }

    let _log_guard = telemetry::init_tracing(settings.telemetry.clone())?;
    metrics::init_metrics()?;

    let store = Arc::new(MemoryStore::new());
    for key in &args.fail_key {
        store.fail_key(key);
    }

    let (observer, mut outcomes, mut reports) = ChannelObserver::with_reports();
    let batch = RedisBatch::builder()
        .client(store.clone())
        .options(settings.batch.clone())
        .observer(Arc::new(observer))
        .build()?;

    let keys = args.keys.max(1);
    let chunks = u32::try_from(args.writes.div_ceil(WRITES_PER_CHUNK).max(1)).unwrap_or(u32::MAX);
    let pause = Duration::from_secs(args.duration_secs)
        .checked_div(chunks)
        .unwrap_or_default();

    info!(
        writes = args.writes,
        keys = keys,
        flush_after_ms = settings.batch.flush_after_ms,
        "Load start"
    );

    for i in 0..args.writes {
        let client = CLIENTS[(i % CLIENTS.len() as u64) as usize];
        batch
            .incr(&format!("demo:counter:{}", i % keys))
            .hincr("demo:hits", client)
            .sadd("demo:clients", client);

        if (i + 1) % WRITES_PER_CHUNK == 0 {
            tokio::time::sleep(pause).await;
        }
    }

    batch.stop(FinalFlush::Flush).await;

    let mut flushes = 0;
    while reports.try_recv().is_ok() {
        flushes += 1;
    }
    let mut failed = 0;
    while let Ok(outcome) = outcomes.try_recv() {
        if !outcome.is_success() {
            failed += 1;
        }
    }

    info!(
        writes = args.writes * 3,
        store_calls = store.call_count(),
        flushes = flushes,
        failed_calls = failed,
        "Load complete"
    );

    println!("{}", serde_json::to_string_pretty(&store.contents())?);

    if args.metrics {
        print!("{}", metrics::gather_metrics());
    }

    Ok(())
}
