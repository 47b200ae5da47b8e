//! # Logging Setup
//!
//! `tracing` subscriber installation for the driver and examples. Log lines
//! always go to stderr; setting `MACHDUMP_LOG_FILE` adds a non-blocking
//! file writer carrying the same events.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! machdump_utils::init_logging().expect("Failed to initialize logging");
//! tracing::info!("driver started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: level or filter directives (e.g. `debug`,
//!   `machdump_core=debug`)
//! - `MACHDUMP_LOG_FORMAT`: `pretty` (default) or `json`
//! - `MACHDUMP_LOG_FILE`: optional log file path

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat
{
    /// Human-readable lines (the default)
    Pretty,
    /// One JSON object per event, for log collectors
    Json,
}

impl FromStr for LogFormat
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        if s.eq_ignore_ascii_case("pretty") {
            Ok(LogFormat::Pretty)
        } else if s.eq_ignore_ascii_case("json") {
            Ok(LogFormat::Json)
        } else {
            Err(format!("Unknown log format: {s}. Use 'pretty' or 'json'"))
        }
    }
}

impl LogFormat
{
    fn from_env() -> Self
    {
        std::env::var("MACHDUMP_LOG_FORMAT")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(LogFormat::Pretty)
    }
}

/// Error installing the global subscriber; in practice this means logging
/// was already initialized.
#[derive(Debug, thiserror::Error)]
#[error("failed to initialize logging: {0}")]
pub struct LoggingError(String);

/// `RUST_LOG` as a filter, or a plain default level when it is unset or
/// unparseable. Built fresh for each layer.
fn env_filter(default_level: Level) -> EnvFilter
{
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()))
}

/// One output layer, parameterized over its destination. Console and file
/// output differ only in the writer and ANSI setting.
fn output_layer(writer: BoxMakeWriter, ansi: bool, format: LogFormat, filter: EnvFilter)
    -> Box<dyn Layer<Registry> + Send + Sync>
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(ansi);

    match format {
        LogFormat::Pretty => base.with_filter(filter).boxed(),
        LogFormat::Json => base.json().with_current_span(true).with_filter(filter).boxed(),
    }
}

/// Initialize logging from the environment (see the module header).
///
/// ## Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging() -> Result<(), LoggingError>
{
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|value| value.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    init_logging_with_level(level, LogFormat::from_env())
}

/// Initialize logging with an explicit default level and format.
/// `RUST_LOG` directives still refine the filter when set.
///
/// ## Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging_with_level(level: Level, format: LogFormat) -> Result<(), LoggingError>
{
    let mut layers = vec![output_layer(
        BoxMakeWriter::new(io::stderr),
        format == LogFormat::Pretty,
        format,
        env_filter(level),
    )];

    if let Some(path) = std::env::var_os("MACHDUMP_LOG_FILE").map(PathBuf::from) {
        let appender = tracing_appender::rolling::never(
            path.parent().unwrap_or_else(|| Path::new(".")),
            path.file_name().unwrap_or_default(),
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // The writer thread must outlive every future log call.
        std::mem::forget(guard);

        layers.push(output_layer(BoxMakeWriter::new(writer), false, format, env_filter(level)));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError(err.to_string()))
}
