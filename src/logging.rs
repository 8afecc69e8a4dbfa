//! Log factory.
//!
//! Two sinks share one subscriber: a daily-rolling file under
//! [`LoggerConfig::path`] filtered at the configured level, and stdout at
//! `debug`. Bound fields are expressed as `tracing` spans: everything logged
//! while a request is being served carries that request's `request_id` and
//! `ua`.

use std::str::FromStr;

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggerConfig;
use crate::error::{Error, Result};

/// Installs the global subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for as
/// long as the application runs. Fails if a global subscriber is already set.
pub fn init(app_name: &str, config: &LoggerConfig) -> Result<WorkerGuard> {
    let level = Level::from_str(&config.level)
        .map_err(|_| Error::Logging(format!("unknown level `{}`", config.level)))?;

    std::fs::create_dir_all(&config.path)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(format!("{app_name}.log"))
        .max_log_files(config.max_age_days.max(1))
        .build(&config.path)
        .map_err(|e| Error::Logging(e.to_string()))?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = if config.format_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_ansi(false)
            .with_writer(file_writer)
            .with_filter(LevelFilter::from_level(level))
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_writer)
            .with_filter(LevelFilter::from_level(level))
            .boxed()
    };

    let stdout_layer = if config.format_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_filter(LevelFilter::DEBUG)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_filter(LevelFilter::DEBUG)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

    Ok(guard)
}
