//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and to a JSON log file,
//! plus helpers that give build, step and database events a uniform shape.

use chrono::Utc;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_structured_logging() {
    init_structured_logging_with_level(None);
}

/// Like [`init_structured_logging`], with `level` taking precedence over
/// `RUST_LOG` and the environment default. Console output goes to stderr.
pub fn init_structured_logging_with_level(level: Option<&str>) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = resolve_log_level(level, &environment);

        let log_dir = PathBuf::from("log");
        let file_layer = match std::fs::create_dir_all(&log_dir) {
            Ok(()) => {
                let log_filename = format!(
                    "{}.{}.{}.log",
                    environment,
                    process::id(),
                    Utc::now().format("%Y%m%d_%H%M%S")
                );
                let file_appender = tracing_appender::rolling::never(&log_dir, log_filename);
                let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
                // The writer must outlive every span, so the guard lives for the process.
                std::mem::forget(guard);
                Some(
                    fmt::layer()
                        .with_writer(file_writer)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_ansi(false)
                        .json()
                        .with_filter(EnvFilter::new(log_level.clone())),
                )
            }
            Err(_) => None,
        };

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(EnvFilter::new(log_level)),
            )
            .with(file_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("BUILDSTEP_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn resolve_log_level(level: Option<&str>, environment: &str) -> String {
    level
        .map(str::to_string)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| get_log_level(environment))
}

fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for build operations
pub fn log_build_operation(
    operation: &str,
    build_id: Option<i64>,
    build_request_id: Option<i64>,
    worker_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        build_id = build_id,
        build_request_id = build_request_id,
        worker_name = worker_name,
        status = %status,
        details = details,
        "BUILD_OPERATION"
    );
}

/// Log structured data for step operations
pub fn log_step_operation(
    operation: &str,
    build_id: Option<i64>,
    step_name: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        build_id = build_id,
        step_name = %step_name,
        status = %status,
        details = details,
        "STEP_OPERATION"
    );
}

/// Log structured data for database operations
pub fn log_database_operation(
    operation: &str,
    table: Option<&str>,
    rows: Option<u64>,
    status: &str,
    duration_ms: Option<u64>,
) {
    tracing::debug!(
        operation = %operation,
        table = table,
        rows = rows,
        status = %status,
        duration_ms = duration_ms,
        "DATABASE_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        "ERROR"
    );
}
