//! Tracing setup for the binary.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Log verbosity used when `RUST_LOG` is unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Everything.
    Trace,
    /// Cache hits and paths.
    Debug,
    /// Downloads and derivations.
    Info,
    /// Fallbacks and failures only.
    Warn,
    /// Errors only.
    Error,
}

impl LogLevel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Install a stderr subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init(level: LogLevel) -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            let level = level.as_str();
            EnvFilter::try_new(format!("lyra={level},lyra_charts={level}"))
        })
        .map_err(|e| miette::miette!("Failed to create tracing filter: {e}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| miette::miette!("Failed to install tracing subscriber: {e}"))
}
