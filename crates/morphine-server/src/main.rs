//! Morphine - host for sandboxed JavaScript extensions.
//!
//! `morphine serve` discovers every extension in the configured directory,
//! loads them into isolated sandboxes and serves their routes under
//! `/extensions/<id>`. `morphine check` runs the same discovery pass and
//! reports what would fail, without binding a socket.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use morphine_config::Config;
use tracing::debug;

mod commands;
mod config_bridge;
mod data;
mod http;

/// Morphine - sandboxed extension host
#[derive(Parser)]
#[command(name = "morphine")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load extensions and serve them over HTTP
    Serve {
        /// Address to listen on, overriding `server.bind`
        #[arg(long)]
        bind: Option<String>,

        /// Extensions directory, overriding `extensions.dir`
        #[arg(long)]
        extensions_dir: Option<PathBuf>,
    },

    /// Run the discovery pass and report failures
    Check {
        /// Extensions directory, overriding `extensions.dir`
        #[arg(long)]
        extensions_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let resolved = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let mut config = resolved.config;

    let log_config = config_bridge::log_config(&config.logging, cli.verbose);
    if let Err(e) = morphine_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }
    for path in &resolved.loaded_files {
        debug!(path = %path.display(), "Loaded config file");
    }

    match cli.command {
        Commands::Serve {
            bind,
            extensions_dir,
        } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(dir) = extensions_dir {
                config.extensions.dir = dir;
            }
            commands::serve::run(config).await
        },
        Commands::Check { extensions_dir } => {
            if let Some(dir) = extensions_dir {
                config.extensions.dir = dir;
            }
            if commands::check::run(config).await? {
                Ok(())
            } else {
                std::process::exit(1);
            }
        },
    }
}
