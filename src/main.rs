//! botli - command-line entry point.

#![warn(missing_docs)]

mod cli;

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result};
use botli::{Bot, BotConfig, ConsoleCommand, EngineBridge, LichessApi, ProcessLauncher, RunningBot};
use clap::Parser;
use cli::Cli;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    initialize_tracing(cli.debug);

    let config = BotConfig::from_file(&cli.config)?;
    let token = config.resolve_token(cli.token.clone())?;
    let matchmaking = cli
        .matchmaking_perf()
        .transpose()
        .map_err(anyhow::Error::msg)?;

    check_engine(&config).await?;

    let api = Arc::new(LichessApi::new(config.url(), &token)?);
    let launcher = Arc::new(ProcessLauncher::new(config.engine().clone()));
    let mut bot = Bot::start(config, api, launcher, cli.upgrade).await?;

    if let Some(id) = cli.tournament.clone() {
        bot.manager()
            .request_tournament_joining(id, cli.team.clone(), cli.password.clone())
            .await?;
    }
    if let Some(perf) = matchmaking {
        bot.manager().request_matchmaking(perf).await?;
    }

    let fatal = run_until_quit(&mut bot).await;

    bot.shutdown().await?;
    fatal?;
    info!("Bye");
    Ok(())
}

#[instrument(skip_all)]
fn initialize_tracing(debug: bool) {
    let default = if debug { "info,botli=debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Tracing initialized");
}

/// Starts the engine once so a broken setup fails before going online.
#[instrument(skip(config))]
async fn check_engine(config: &BotConfig) -> Result<()> {
    let engine = EngineBridge::start(config.engine())
        .await
        .context("Engine failed to start")?;
    info!(engine = %engine.name(), "Engine ready");
    engine.quit().await;
    Ok(())
}

/// Reads console commands or waits for a signal; returns the event-stream error if it died.
async fn run_until_quit(bot: &mut RunningBot) -> Result<()> {
    let interactive = std::io::stdin().is_terminal();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = interactive;

    if interactive {
        info!("Type help for a list of commands");
    }

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match line.parse::<ConsoleCommand>() {
                    Ok(command) => match command.execute(bot).await {
                        Ok(true) => return Ok(()),
                        Ok(false) => {}
                        Err(err) => warn!(error = %err, "Command failed"),
                    },
                    Err(err) => warn!(error = %err.message, "Invalid command"),
                },
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = terminate_signal() => {
                info!("Signal received");
                return Ok(());
            }
            result = bot.stopped() => {
                error!(result = ?result, "Event handler ended");
                return result.context("Event stream failed");
            }
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
