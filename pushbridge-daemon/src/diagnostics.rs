//! Command line and logging setup

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Pushbridge daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "pushbridge-daemon")]
#[command(about = "Mirror Pushbullet SMS threads and pushes into the terminal", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: ~/.config/pushbridge/daemon.toml)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Load this device at startup instead of the configured one
    #[arg(short, long, value_name = "DEVICE_ID")]
    pub device: Option<String>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub timestamps: bool,

    /// Diagnostic subcommand
    #[command(subcommand)]
    pub command: Option<DiagnosticCommand>,
}

/// Commands that run instead of the bridge
#[derive(Subcommand, Debug)]
pub enum DiagnosticCommand {
    /// Show daemon version
    Version,

    /// Show current configuration
    DumpConfig {
        /// Show the access token unredacted
        #[arg(long)]
        show_sensitive: bool,
    },
}

/// Initialize logging based on CLI configuration
///
/// Logs go to stderr; stdout belongs to the channels.
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}
