//! Logging system configuration and initialization
//!
//! This module provides the logging setup with:
//! - Configuration file based log level control (`RUST_LOG` wins when set)
//! - Structured JSON logging (optional)
//! - Console and file output support
//! - Local timezone timestamps

#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use lazy_static::lazy_static;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{Subscriber, info};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;
use crate::infrastructure::config::ConfigManager;

const LOG_FILE_NAME: &str = "shelf-sentinel.log";

// Global guard to keep the log file writer alive
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> =
        Mutex::new(Vec::new());
}

/// Timestamps in the host's local timezone
struct LocalTimeFormatter;

impl FormatTime for LocalTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f %z"))
    }
}

/// Resolve the log directory: explicit config, then the platform data dir, then `./logs`.
pub fn get_log_directory(config: &LoggingConfig) -> PathBuf {
    config.log_dir.clone().unwrap_or_else(|| {
        ConfigManager::get_app_data_dir()
            .map(|dir| dir.join("logs"))
            .unwrap_or_else(|_| PathBuf::from("logs"))
    })
}

/// Build the filter: `RUST_LOG` if present, otherwise the configured level plus module caps.
pub fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = EnvFilter::new(&config.level);

        // Dependency noise stays capped unless TRACE is requested
        if !config.level.eq_ignore_ascii_case("trace") {
            let mut modules: Vec<_> = config.module_filters.iter().collect();
            modules.sort();
            for (module, level) in modules {
                if let Ok(directive) = format!("{}={}", module, level).parse() {
                    filter = filter.add_directive(directive);
                }
            }
        }

        if let Ok(directive) = format!("shelf_sentinel={}", config.level).parse() {
            filter = filter.add_directive(directive);
        }
        filter
    })
}

/// Console-only subscriber for work that runs before the configured one exists.
///
/// Scope it with `tracing::instrument::WithSubscriber` so the global
/// subscriber can still be installed afterwards.
pub fn bootstrap_subscriber() -> impl Subscriber + Send + Sync + 'static {
    console_subscriber(build_env_filter(&LoggingConfig::default()), std::io::stdout)
}

fn console_subscriber<W>(filter: EnvFilter, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    Registry::default().with(filter).with(
        fmt::Layer::new()
            .with_writer(writer)
            .with_timer(LocalTimeFormatter)
            .with_target(false),
    )
}

/// Initialize the logging system with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Initialize logging with custom configuration
///
/// # Environment Variable Override
/// ```bash
/// # Show detailed HTTP logs
/// RUST_LOG="debug,reqwest=debug,hyper=debug" shelf-sentinel
/// ```
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_env_filter(config);

    let file_layer = if config.file_output {
        let log_dir = get_log_directory(config);
        let writer = open_file_writer(&log_dir)?;
        let layer = fmt::Layer::new()
            .with_writer(writer)
            .with_timer(LocalTimeFormatter)
            .with_ansi(false);
        let layer = if config.json_format {
            layer
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .boxed()
        } else {
            layer.with_target(false).boxed()
        };
        Some(layer)
    } else {
        None
    };

    let console_layer = config.console_output.then(|| {
        fmt::Layer::new()
            .with_writer(std::io::stdout)
            .with_timer(LocalTimeFormatter)
            .with_target(false)
            .boxed()
    });

    Registry::default()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    info!(
        "📝 Logging initialized (level: {}, file: {}, json: {})",
        config.level, config.file_output, config.json_format
    );
    Ok(())
}

fn open_file_writer(log_dir: &Path) -> Result<non_blocking::NonBlocking> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

    let file_appender = rolling::never(log_dir, LOG_FILE_NAME);
    let (writer, guard) = non_blocking(file_appender);

    // Store the guard globally to prevent it from being dropped
    LOG_GUARDS
        .lock()
        .map_err(|_| anyhow!("Log guard registry poisoned"))?
        .push(guard);
    Ok(writer)
}
