//! Structured logging setup. Installs a `tracing_subscriber::fmt` subscriber
//! backed either by a blocking stdout writer or, when a log directory is
//! configured, a daily-rolling file fed through `tracing_appender`'s
//! non-blocking worker -- the Rust analogue of `AsyncLogging`'s
//! front/back-buffer swap, adopted wholesale rather than hand-rolled.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;

/// Mirrors the original's `TRACE,DEBUG,INFO,WARN,ERROR,FATAL` taxonomy.
/// `Fatal` has no distinct tracing level; call sites that would log at it go
/// through [`crate::error::fatal`] instead, which logs at `error!` and aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

pub struct LogConfig {
    pub level: LogLevel,
    pub log_dir: Option<PathBuf>,
}

/// Installs the global subscriber. The returned `WorkerGuard` must be kept
/// alive for the process's lifetime when `log_dir` is set -- dropping it
/// flushes the non-blocking writer's queue, the same role `AsyncLogging`'s
/// destructor plays in the original.
pub fn init(cfg: &LogConfig) -> WorkerGuard {
    let level = cfg.level.as_tracing_level();

    match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "reactord.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            guard
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            tracing_subscriber::fmt().with_max_level(level).with_writer(writer).init();
            guard
        }
    }
}
