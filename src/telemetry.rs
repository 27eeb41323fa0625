/// Telemetry Module - Structured Logging with Tracing
///
/// - Structured logging with tracing
/// - JSON vs pretty format support
/// - File logging with rotation
/// - RUST_LOG env var support
/// - Truncation helpers for keys and member lists

use serde::Deserialize;
use std::error::Error;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub log_level: String,
    /// Log format: "json" or "pretty"
    pub log_format: String,
    /// Optional log file path (None = console only)
    pub log_file: Option<String>,
    /// Rotation interval: "daily", "hourly", "never"
    pub rotation: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: std::env::var("REDIS_BATCH_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            log_file: std::env::var("REDIS_BATCH_LOG_FILE").ok(),
            rotation: "daily".to_string(),
        }
    }
}

/// Writer for log lines: stdout, or a rotating file behind a non-blocking
/// worker whose guard must outlive the subscriber
fn log_writer(config: &TelemetryConfig) -> Result<(BoxMakeWriter, Option<WorkerGuard>), Box<dyn Error>> {
    let Some(log_file_path) = &config.log_file else {
        return Ok((BoxMakeWriter::new(std::io::stdout), None));
    };

    let path = Path::new(log_file_path);
    let directory = path.parent()
        .ok_or("Invalid log file path: no parent directory")?;
    let file_name = path.file_name()
        .ok_or("Invalid log file path: no filename")?;
    let filename_prefix = path.file_stem()
        .and_then(|s| s.to_str())
        .ok_or("Invalid log file path: no filename")?;

    let file_appender = match config.rotation.as_str() {
        "hourly" => rolling::hourly(directory, filename_prefix),
        "never" => rolling::never(directory, file_name),
        _ => rolling::daily(directory, filename_prefix),
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    Ok((BoxMakeWriter::new(non_blocking), Some(guard)))
}

/// Initialize tracing subscriber
///
/// - Reads RUST_LOG env var (falls back to `log_level`)
/// - Supports JSON vs pretty format
/// - Optional file logging with rotation
///
/// Hold the returned guard until shutdown, otherwise buffered file logs are lost.
pub fn init_tracing(config: TelemetryConfig) -> Result<Option<WorkerGuard>, Box<dyn Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let (writer, guard) = log_writer(&config)?;

    let fmt_layer = if config.log_format == "json" {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(guard)
}

/// Truncate a key for logging
///
/// Example: "session:0a1b2c3d4e5f67890a1b" (max 12) → "session:0a1b..."
pub fn truncate_key(key: &str, len: usize) -> String {
    match key.char_indices().nth(len) {
        Some((idx, _)) => format!("{}...", &key[..idx]),
        None => key.to_string(),
    }
}

/// Truncate list for logging
///
/// Shows first N items, indicates total count if longer
///
/// Example: ["a", "b", "c", "d", "e", "f"] (max 3) → "[3 of 6]: [\"a\", \"b\", \"c\"]"
pub fn truncate_list<T: std::fmt::Display + std::fmt::Debug>(items: &[T], max: usize) -> String {
    if items.len() <= max {
        format!("{:?}", items)
    } else {
        let preview: Vec<String> = items.iter().take(max).map(|i| i.to_string()).collect();
        format!("[{} of {}]: {:?}", max, items.len(), preview)
    }
}
