//! Thin wrapper around `slog`/`sloggers`, in the same spirit as `flux::logging`:
//! one process-wide root logger built from a small config, then `.new(o!())`'d
//! per component so every log line carries its own key-values (worker id,
//! service address, connection fd) without the caller having to thread them
//! through every call.

pub use slog::{self, debug, error, info, o, trace, warn, Logger};

use serde_derive::{Deserialize, Serialize};
use sloggers::types::Severity;
use sloggers::Config;

/// Logging configuration, loadable from the same TOML config file as the rest
/// of the runtime (see `ember_runtime::config::RuntimeConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub destination: LogDestination,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDestination {
    Stderr,
    Stdout,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: LogLevel::Info,
            destination: LogDestination::Stderr,
        }
    }
}

impl LogConfig {
    /// Builds the root logger. Should be called once at process start; every
    /// worker, service and connection derives a child logger from the result.
    pub fn build(&self) -> Logger {
        let severity = match self.level {
            LogLevel::Trace => Severity::Trace,
            LogLevel::Debug => Severity::Debug,
            LogLevel::Info => Severity::Info,
            LogLevel::Warning => Severity::Warning,
            LogLevel::Error => Severity::Error,
        };

        let destination = match self.destination {
            LogDestination::Stderr => sloggers::terminal::Destination::Stderr,
            LogDestination::Stdout => sloggers::terminal::Destination::Stdout,
        };

        let mut builder = sloggers::terminal::TerminalLoggerBuilder::new();
        builder.level(severity);
        builder.destination(destination);

        builder.build().expect("failed to build root logger")
    }

    /// Convenience for binaries/tests that don't care about config loading.
    pub fn discard() -> Logger {
        Logger::root(slog::Discard, o!())
    }
}
