//! Process-wide `tracing` subscriber for applications embedding the client.
//!
//! Installed by [`crate::connect`] when the client configuration carries a
//! [`LogConfig`], or directly through [`init`].

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

/// Crates whose trace output drowns the client's own.
const NOISY_TARGETS: [&str; 5] = ["tokio_tungstenite", "tungstenite", "native_tls", "hyper", "mio"];

/// Flushes the non-blocking writer; `Some` once a subscriber is installed.
static INSTALLED: Mutex<Option<WorkerGuard>> = parking_lot::const_mutex(None);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown log level {0:?}")]
pub struct ParseLevelError(String);

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
    /// Raw `EnvFilter` directives; replaces the level-derived filter.
    pub filter: Option<String>,
    /// Keep trace output of transport dependencies at `trace` level.
    pub trace_dependencies: bool,
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// Logging requested through `FLOWLINE_LOG_LEVEL` or `FLOWLINE_LOG_FILE`.
    /// `None` when neither is set, so embedding applications keep their own
    /// subscriber.
    pub fn from_env() -> Option<Self> {
        let level = env::var("FLOWLINE_LOG_LEVEL").ok();
        let file = env::var_os("FLOWLINE_LOG_FILE")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        if level.is_none() && file.is_none() {
            return None;
        }
        Some(Self {
            level: level.and_then(|value| value.parse().ok()).unwrap_or_default(),
            file,
            filter: env::var("FLOWLINE_LOG_FILTER")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            trace_dependencies: super::env_truthy("FLOWLINE_TRACE_DEPS").unwrap_or(false),
        })
    }

    /// Filter directives for this configuration, and whether dependency
    /// traces were capped.
    pub fn directives(&self) -> (String, bool) {
        if let Some(filter) = &self.filter {
            return (filter.clone(), false);
        }
        let ours = self.level.as_str();
        let mut directives = match self.level {
            LogLevel::Debug | LogLevel::Trace => {
                format!("info,flowline={ours},flowline_client={ours},flowline_proto={ours}")
            }
            _ => ours.to_string(),
        };
        let capped = self.level == LogLevel::Trace && !self.trace_dependencies;
        if capped {
            for target in NOISY_TARGETS {
                directives.push_str(&format!(",{target}=info"));
            }
        }
        (directives, capped)
    }

    fn writer(&self) -> Result<(NonBlocking, WorkerGuard), InitError> {
        match &self.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                Ok(tracing_appender::non_blocking(file))
            }
            None => Ok(tracing_appender::non_blocking(io::stderr())),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

/// Install the global subscriber. Once one is installed, later calls return
/// `Ok` without touching it.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    let mut installed = INSTALLED.lock();
    if installed.is_some() {
        return Ok(());
    }

    let (directives, capped) = config.directives();
    let filter = EnvFilter::try_new(&directives)
        .map_err(|err| InitError::Configure(format!("bad filter {directives:?}: {err}")))?;
    let (writer, guard) = config.writer()?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    *installed = Some(guard);

    tracing::debug!(target: "flowline", filter = %directives, "logging initialised");
    if capped {
        tracing::info!(
            target: "flowline",
            "dependency traces capped at info; set FLOWLINE_TRACE_DEPS=1 to keep them"
        );
    }
    Ok(())
}
