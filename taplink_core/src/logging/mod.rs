//! Logging setup for taplink.
//!
//! Everything in the crate logs through `tracing` with structured fields
//! (`link`, `peer`, `device`, `direction`). This module installs the global
//! subscriber once per process.

use std::path::PathBuf;
use tracing::Level;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    prelude::*,
    EnvFilter, Layer, Registry,
};

use crate::config::Config;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Line format for every sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// A daily-rolling log file: `<dir>/<prefix>.YYYY-MM-DD`.
#[derive(Debug, Clone)]
pub struct FileSink {
    pub dir: PathBuf,
    pub prefix: String,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        FileSink {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }
}

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Most verbose level recorded; `RUST_LOG` directives still apply
    pub level: Level,

    pub format: LogFormat,

    /// Write to stdout (default: true)
    pub stdout: bool,

    /// Also write to a rolling file (default: none)
    pub file: Option<FileSink>,

    /// Include source file and line (default: true)
    pub source_location: bool,

    /// Log link span open/close, which brackets each link's lifetime
    pub span_events: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            format: LogFormat::Text,
            stdout: true,
            file: None,
            source_location: true,
            span_events: false,
        }
    }
}

impl LogOptions {
    fn span_mask(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .with_file(self.source_location)
            .with_line_number(self.source_location)
            .with_span_events(self.span_mask());

        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Text => layer.boxed(),
        }
    }
}

/// Parse a level name, falling back to INFO for anything unrecognised.
pub fn parse_level(name: &str) -> Level {
    name.trim().parse().unwrap_or(Level::INFO)
}

/// Install the global subscriber.
///
/// The returned guard flushes the file sink when dropped, so hold it until
/// the program exits. It is `None` when no file sink is configured. A second
/// call in the same process leaves the first subscriber in place.
///
/// ```
/// use taplink_core::logging::{init_logging, LogFormat, LogOptions};
/// use tracing::Level;
///
/// let _guard = init_logging(LogOptions {
///     level: Level::DEBUG,
///     format: LogFormat::Json,
///     ..Default::default()
/// });
/// ```
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if options.stdout {
        layers.push(options.layer(std::io::stdout, true));
    }

    if let Some(sink) = &options.file {
        let appender = RollingFileAppender::new(Rotation::DAILY, &sink.dir, &sink.prefix);
        let (writer, worker_guard) = NonBlocking::new(appender);
        guard = Some(worker_guard);
        layers.push(options.layer(writer, false));
    }

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());
    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init();

    guard
}

/// Stdout text logging at INFO.
pub fn init_default_logging() -> Option<WorkerGuard> {
    init_logging(LogOptions::default())
}

/// Stdout logging at the level named in `config.log_level`.
pub fn init_logging_from_config(config: &Config) -> Option<WorkerGuard> {
    init_logging(LogOptions {
        level: parse_level(&config.log_level),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use tracing::{debug, info};

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level(" WARN "), Level::WARN);
        assert_eq!(parse_level("chatty"), Level::INFO);
    }

    #[test]
    fn test_span_mask_follows_option() {
        let quiet = LogOptions::default();
        assert_eq!(quiet.span_mask(), FmtSpan::NONE);

        let loud = LogOptions {
            span_events: true,
            ..Default::default()
        };
        assert_eq!(loud.span_mask(), FmtSpan::NEW | FmtSpan::CLOSE);
    }

    #[test]
    fn test_file_sink_creates_file() {
        let dir = tempdir().unwrap();

        let _guard = init_logging(LogOptions {
            level: Level::TRACE,
            stdout: false,
            file: Some(FileSink::new(dir.path(), "taplink-test")),
            ..Default::default()
        });

        debug!(link = 1, "link opened");
        info!(peer = "127.0.0.1:9981", "peer connected");

        // The appender creates its file eagerly
        let entries = fs::read_dir(dir.path()).unwrap();
        assert!(entries.count() > 0);
    }
}
