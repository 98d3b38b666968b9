//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level.

use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LogLevel, LogOutput, LoggingConfig};

/// Errors from logging setup.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log file could not be opened for appending.
    #[error("failed to open log file '{path}': {source}")]
    OpenFile {
        /// Log file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A global subscriber is already installed.
    #[error("logging is already initialized")]
    AlreadyInitialized,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// `OpenFile` when file output cannot be opened, `AlreadyInitialized` when a
/// subscriber was installed earlier in the process.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let layer = match config.output {
        LogOutput::Stdout => fmt_layer(
            config.format,
            std::io::stdout,
            std::io::stdout().is_terminal(),
        ),
        LogOutput::Stderr => fmt_layer(
            config.format,
            std::io::stderr,
            std::io::stderr().is_terminal(),
        ),
        LogOutput::File => {
            let path = config
                .file_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("spf.log"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| LoggingError::OpenFile { path, source })?;
            fmt_layer(config.format, Mutex::new(file), false)
        },
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter(config.level))
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

fn default_directives(level: LogLevel) -> String {
    format!("warn,spf={level}")
}

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true);

    match format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}
