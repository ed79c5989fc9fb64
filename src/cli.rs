//! Command-line interface for botli.

use std::path::PathBuf;

use clap::Parser;

use botli::PerfType;

/// botli - unattended chess bot for the Lichess Bot API
#[derive(Parser, Debug)]
#[command(name = "botli")]
#[command(about = "Plays games on Lichess with a UCI engine", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to the TOML configuration
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// API token, overrides LICHESS_TOKEN and the config file
    #[arg(long)]
    pub token: Option<String>,

    /// Start matchmaking right away, optionally for one perf type
    #[arg(short, long, num_args = 0..=1, default_missing_value = "all")]
    pub matchmaking: Option<String>,

    /// Join this tournament on start
    #[arg(short, long)]
    pub tournament: Option<String>,

    /// Team to play for in the tournament
    #[arg(long, requires = "tournament")]
    pub team: Option<String>,

    /// Tournament password
    #[arg(long, requires = "tournament")]
    pub password: Option<String>,

    /// Convert a regular account into a bot account; cannot be undone
    #[arg(short, long)]
    pub upgrade: bool,

    /// Verbose logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Cli {
    /// Perf type restriction of `--matchmaking`; `None` inside means every configured type.
    pub fn matchmaking_perf(&self) -> Option<Result<Option<PerfType>, String>> {
        self.matchmaking.as_deref().map(|value| match value {
            "all" => Ok(None),
            perf => perf
                .parse()
                .map(Some)
                .map_err(|_| format!("Unknown perf type {}", perf)),
        })
    }
}
