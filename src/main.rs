//! # lchat
//!
//! Line-oriented chat client: every stdin line is sent to the hub, every
//! message on the session stream is printed to stdout.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use lchat_client::ChatService;
use lchat_core::Message;
use lchat_telemetry::{LogFormat, TelemetryConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

/// Chat hub client.
#[derive(Parser, Debug)]
#[command(name = "lchat", about = "Chat with an LLM hub from the terminal")]
struct Cli {
    /// Settings file (defaults to `~/.lchat/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hub endpoint, overriding settings.
    #[arg(long)]
    url: Option<String>,

    /// Connect the WebSocket directly without negotiating.
    #[arg(long)]
    skip_negotiation: bool,

    /// Log level, overriding settings (`RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

fn render(message: &Message) -> String {
    format!(
        "[{} {}] {}",
        message.timestamp.format("%H:%M:%S"),
        message.kind,
        message.content
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => lchat_settings::load_settings_from_path(path),
        None => lchat_settings::load_settings(),
    }
    .context("Failed to load settings")?;
    if let Some(url) = cli.url {
        settings.hub_url = url;
    }
    if cli.skip_negotiation {
        settings.skip_negotiation = true;
    }
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }

    let mut telemetry = TelemetryConfig::with_level_name(&settings.log_level);
    if cli.json_logs {
        telemetry.format = LogFormat::Json;
    }
    let _ = lchat_telemetry::init_telemetry(&telemetry);

    tracing::info!(url = %settings.hub_url, "Starting lchat");

    let service = ChatService::from_settings(&settings).context("Invalid settings")?;
    let mut messages = service.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(message) => println!("{}", render(&message)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "output fell behind, messages dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    service.start().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.trim() == "/reconnect" => service.start().await,
                Some(line) if line.trim().is_empty() => {}
                Some(line) => service.send(line).await,
                None => break,
            },
        }
    }

    tracing::info!("Shutting down");
    service.dispose().await;
    drop(service);
    let _ = printer.await;
    Ok(())
}
