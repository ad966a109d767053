//! Command-line definition.

use clap::{Parser, Subcommand};
use lyra_charts::ChartId;
use std::path::PathBuf;

use crate::logging::LogLevel;

/// Fetch and cache chart packages.
#[derive(Parser, Debug)]
#[command(name = "lyra")]
#[command(about = "Fetch and cache chart packages")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML).
    #[arg(long, short = 'c', global = true, value_name = "PATH", env = "LYRA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Cache directory, overriding the configuration.
    #[arg(long, global = true, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Logging verbosity when `RUST_LOG` is unset.
    #[arg(
        short = 'L',
        long,
        global = true,
        default_value = "info",
        value_enum
    )]
    pub level: LogLevel,
}

/// Available subcommands.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Return the cached package for a chart, fetching it if needed.
    #[command(about = "Return the cached package for a chart, fetching it if needed")]
    Get {
        /// Chart id.
        #[arg(value_name = "ID")]
        id: ChartId,

        /// Request the package without embedded video.
        #[arg(long)]
        light: bool,
    },

    /// List cached packages and the recency order.
    #[command(about = "List cached packages and the recency order")]
    Scan,

    /// Re-fetch the chart index.
    #[command(about = "Re-fetch the chart index")]
    RefreshIndex,
}
