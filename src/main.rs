#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use streamherald::alert::Alerter;
use streamherald::config::Config;
use streamherald::notifier::{Notifier, UpstreamEvent};
use streamherald::telegram::{MessageTransport, TelegramBot};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Live-stream state notifications for Telegram.
///
/// Reads newline-delimited upstream events (JSON) on stdin; the feed
/// transport that produces them runs as a separate process.
#[derive(Parser, Debug)]
#[command(name = "streamherald", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "streamherald.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("streamherald=info")),
        )
        .init();

    let config = Config::load(&cli.config).await?;

    let bot = Arc::new(TelegramBot::new(
        config.telegram.bot.token.clone(),
        config.telegram.bot.name.clone(),
    ));
    let chat_bot = config
        .telegram
        .chat_bot
        .as_ref()
        .map(|chat_bot| Arc::new(TelegramBot::new(chat_bot.token.clone(), chat_bot.name.clone())));

    let alerter = match &config.alerts {
        Some(alerts) => Alerter::new(
            Arc::clone(&bot) as Arc<dyn MessageTransport>,
            alerts.chat_id.clone(),
            alerts.label.clone(),
        ),
        None => Alerter::disabled(),
    };

    let destinations = config.destinations.clone();
    let notifier = Notifier::new(config, alerter);
    for destination in &destinations {
        // A destination addressed to the chat bot's name delivers through
        // it; everything else uses the notification bot.
        let selected = match (&destination.bot_name, &chat_bot) {
            (Some(name), Some(chat_bot)) if *name == chat_bot.bot_name() => chat_bot,
            _ => &bot,
        };
        notifier
            .add_destination(destination, selected)
            .with_context(|| format!("failed to add destination {}", destination.chat_id))?;
    }
    info!("{} destinations ready; reading events from stdin", destinations.len());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("failed to read upstream event stream")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match serde_json::from_str::<UpstreamEvent>(&line) {
                        Ok(event) => notifier.handle_event(event),
                        Err(err) => warn!("ignoring malformed upstream event: {err}"),
                    },
                    None => {
                        error!("upstream event stream closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}
