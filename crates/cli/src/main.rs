//! lyra command-line application
//!
//! Thin front end over `lyra-charts`: loads the configuration, opens the
//! cache and prints what a subcommand produced.

// CLI binary prints its results to stdout
#![allow(clippy::print_stdout)]

mod cli;
mod commands;
mod logging;

use clap::Parser;
use lyra_charts::CacheConfig;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.level)?;

    let mut config = CacheConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }
    tracing::debug!(cache_dir = ?config.cache_dir, "Configuration loaded");

    let output = commands::run(cli.command, &config).await?;
    println!("{output}");
    Ok(())
}
