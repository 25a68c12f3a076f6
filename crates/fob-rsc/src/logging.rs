//! Stderr subscriber for hosts that do not install their own.
//!
//! Compiled with the `logging` feature. The events worth knowing about:
//!
//! - `info` "request": one line per request from the `request-log`
//!   middleware, with `method`, `path`, `status` and `elapsed_ms`.
//! - `info` "snapshot complete": written and skipped file counts of a
//!   static build.
//! - `error` "error while serializing payload": carries the `digest` that the
//!   client receives, so a failed render can be matched to its log line.
//! - `debug`: how each request was classified and which middleware ran.
//!
//! Other crates are held at `warn` unless `RUST_LOG` says otherwise.

use std::sync::Once;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable read by [`init_logging_from_env`] when `RUST_LOG` is unset.
pub const LOG_ENV: &str = "FOB_RSC_LOG";

static INIT: Once = Once::new();

/// Verbosity of the `fob_rsc` targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Silent,
    /// Failed requests and serialization digests
    Error,
    Warn,
    /// Request lines and snapshot summaries
    #[default]
    Info,
    /// Classification and pipeline details
    Debug,
    Trace,
}

impl LogLevel {
    /// Filter used when `RUST_LOG` is unset.
    fn directive(self) -> String {
        match self {
            LogLevel::Silent => "off".to_string(),
            LogLevel::Error => "error,fob_rsc=error".to_string(),
            level => format!("warn,fob_rsc={level}"),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Silent => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "silent" | "off" => Ok(LogLevel::Silent),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("Invalid log level: {}", other)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log `fob_rsc` events at `level` to stderr.
///
/// A set `RUST_LOG` replaces the filter entirely. The first call in a process
/// wins, and a global subscriber installed by the host is kept.
///
/// ```rust,no_run
/// use fob_rsc::logging::{init_logging, LogLevel};
///
/// init_logging(LogLevel::Debug);
/// ```
pub fn init_logging(level: LogLevel) {
    INIT.call_once(|| install(level));
}

/// Like [`init_logging`], with the level taken from `FOB_RSC_LOG`.
///
/// Falls back to [`LogLevel::Info`] when the variable is unset or invalid.
pub fn init_logging_from_env() {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or_default();
    init_logging(level);
}

fn install(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .parse_lossy(level.directive())
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_target(false))
        .try_init();

    if installed.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
