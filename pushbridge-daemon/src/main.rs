mod commands;
mod config;
mod diagnostics;
mod terminal_host;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use commands::ReaderExit;
use diagnostics::{Cli, DiagnosticCommand};
use pushbridge_protocol::{Bridge, NetDispatcher, PushbulletApi};
use terminal_host::TerminalHost;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Handle diagnostic commands
fn handle_diagnostic_command(cli: &Cli, command: &DiagnosticCommand) -> Result<()> {
    match command {
        DiagnosticCommand::Version => {
            println!("pushbridge-daemon v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        DiagnosticCommand::DumpConfig { show_sensitive } => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let mut config =
                Config::load(Some(path.as_path())).context("Failed to load configuration")?;
            config.apply_env();

            println!("\n=== Daemon Configuration ===");
            println!("File: {}", path.display());

            println!("\n[Account]");
            if *show_sensitive {
                println!("Access token: {}", config.account.access_token);
            } else {
                println!("Access token: {}", config.redacted_token());
            }
            println!(
                "Default device: {}",
                config.account.default_device.as_deref().unwrap_or("(none)")
            );

            println!("\n[Network]");
            println!("API: {}", config.network.api_base_url);
            println!("Stream: {}", config.network.stream_base_url);
            println!("Request timeout: {} seconds", config.network.request_timeout_secs);
            println!(
                "Stream idle timeout: {} seconds",
                config.network.stream_idle_timeout_secs
            );

            println!("\n[Reconnect]");
            println!("Initial delay: {} seconds", config.reconnect.initial_delay_secs);
            println!("Max delay: {} seconds", config.reconnect.max_delay_secs);

            Ok(())
        }
    }
}

/// Resolves on Ctrl+C; never resolves if the signal cannot be installed
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(command) = &cli.command {
        return handle_diagnostic_command(&cli, command);
    }

    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    info!("Starting pushbridge daemon...");

    let mut config =
        Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.apply_env();
    if let Some(device) = &cli.device {
        config.account.default_device = Some(device.clone());
    }
    config.validate().context("Invalid configuration")?;

    info!("Configuration loaded");
    info!("API: {}", config.network.api_base_url);
    info!(
        "Default device: {}",
        config.account.default_device.as_deref().unwrap_or("(none)")
    );

    let (completion_tx, completion_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let host = TerminalHost::new();
    let directory = host.directory();
    let api = PushbulletApi::with_base_urls(
        config.account.access_token.clone(),
        &config.network.api_base_url,
        &config.network.stream_base_url,
    );
    let dispatcher = NetDispatcher::new(completion_tx)
        .with_stream_idle_timeout(config.network.stream_idle_timeout());

    let bridge = Bridge::new(
        config.bridge_config(),
        Box::new(host),
        Box::new(api),
        Box::new(dispatcher),
    );

    // Stdin is read on a plain thread so a pending read never holds up exit.
    // `event_tx` stays alive here, so the bridge keeps running after stdin
    // ends; only /quit or Ctrl+C stop it.
    let (quit_tx, quit_rx) = oneshot::channel();
    let reader_events = event_tx.clone();
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            if commands::read_stdin(directory, reader_events) == ReaderExit::Quit {
                let _ = quit_tx.send(());
            }
        })
        .context("Failed to start stdin reader")?;

    let shutdown = async move {
        tokio::select! {
            _ = shutdown_signal() => {}
            Ok(()) = quit_rx => info!("Stopping on /quit"),
        }
    };

    info!("Press Ctrl+C or type /quit to stop");
    let bridge = bridge.run(completion_rx, event_rx, shutdown).await;
    drop(event_tx);

    info!(
        "Daemon stopped with {} channels open",
        bridge.session().registry.len()
    );
    Ok(())
}
