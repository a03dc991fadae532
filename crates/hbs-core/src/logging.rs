//! Subscriber setup for hosts of the HBS crates.
//!
//! The library crates only emit `tracing` events: `warn` for stale or
//! unreadable caches and dropped rows, `info` for tables loaded, built, and
//! cached, `debug` for pipeline steps and base table sources.
//!
//! ```ignore
//! use hbs_core::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::from_verbosity(1))?;
//! ```

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Crates that follow the configured level; everything else logs at `warn`.
const HBS_CRATES: &[&str] = &[
    "hbs_common",
    "hbs_core",
    "hbs_ingest",
    "hbs_metadata",
    "hbs_model",
    "hbs_transform",
];

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event.
    Json,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    pub with_timestamps: bool,
    /// Include the emitting module path.
    pub with_target: bool,
    pub with_ansi: bool,
    /// Append here instead of writing to stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::default(),
            with_timestamps: false,
            with_target: false,
            with_ansi: true,
            log_file: None,
        }
    }
}

impl LogConfig {
    /// 0 is `info`, 1 is `debug`, anything higher is `trace`.
    #[must_use]
    pub fn from_verbosity(verbosity: u8) -> Self {
        let level = match verbosity {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        Self {
            level,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_timestamps(mut self, enable: bool) -> Self {
        self.with_timestamps = enable;
        self
    }

    /// Log to a file; ANSI colors are turned off.
    #[must_use]
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self.with_ansi = false;
        self
    }

    /// `RUST_LOG` when set, otherwise the configured level for the HBS crates.
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(self.level)))
    }

    fn fmt_layer<W>(&self, writer: W) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(self.with_target)
            .with_ansi(self.with_ansi);
        match (self.format, self.with_timestamps) {
            (LogFormat::Json, _) => layer.json().boxed(),
            (LogFormat::Compact, true) => layer.compact().boxed(),
            (LogFormat::Compact, false) => layer.compact().without_time().boxed(),
            (LogFormat::Pretty, true) => layer.boxed(),
            (LogFormat::Pretty, false) => layer.without_time().boxed(),
        }
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if the log file cannot be opened or a global subscriber is
/// already installed.
pub fn init_logging(config: &LogConfig) -> io::Result<()> {
    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            init_logging_with_writer(config, Mutex::new(file))
        }
        None => init_logging_with_writer(config, io::stderr),
    }
}

/// Installs the global subscriber writing to `writer`.
pub fn init_logging_with_writer<W>(config: &LogConfig, writer: W) -> io::Result<()>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(config.fmt_layer(writer))
        .with(config.env_filter())
        .try_init()
        .map_err(io::Error::other)
}

fn default_directives(level: Level) -> String {
    let level = level.as_str().to_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(HBS_CRATES.iter().map(|name| format!("{name}={level}")));
    directives.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(LogConfig::from_verbosity(0).level, Level::INFO);
        assert_eq!(LogConfig::from_verbosity(1).level, Level::DEBUG);
        assert_eq!(LogConfig::from_verbosity(5).level, Level::TRACE);
    }

    #[test]
    fn test_log_file_disables_ansi() {
        let config = LogConfig::default()
            .with_format(LogFormat::Json)
            .with_log_file("hbs.log");
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.with_ansi);
        assert_eq!(config.log_file, Some(PathBuf::from("hbs.log")));
    }

    #[test]
    fn test_default_directives() {
        let directives = default_directives(Level::DEBUG);
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("hbs_core=debug"));
        assert!(directives.contains("hbs_transform=debug"));
        assert!(!directives.contains("polars"));
    }
}
