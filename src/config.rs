//! Bot configuration loaded from TOML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_getters::Getters;
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{BackoffConfig, ChallengeColor, Speed, TimeControl, Variant};

/// Environment variable holding the API token.
pub const TOKEN_ENV: &str = "LICHESS_TOKEN";

/// What to do with a game start that would exceed the concurrency ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Hold the game until a slot frees.
    #[default]
    Queue,
    /// Abort the game on the server.
    Abort,
}

/// Top-level bot configuration.
#[derive(Debug, Clone, Getters, Serialize, Deserialize)]
pub struct BotConfig {
    /// API token. The environment variable takes precedence.
    #[serde(default)]
    token: Option<String>,

    /// Server base URL.
    #[serde(default = "default_url")]
    url: String,

    /// Maximum number of games played at the same time.
    #[serde(default = "default_max_games")]
    max_games: usize,

    /// Handling of game starts beyond `max_games`.
    #[serde(default)]
    overflow_policy: OverflowPolicy,

    /// Engine process settings.
    engine: EngineConfig,

    /// Clock handling and session timeouts.
    #[serde(default)]
    timing: TimingConfig,

    /// Event stream handling.
    #[serde(default)]
    stream: StreamConfig,

    /// Filters for incoming challenges.
    #[serde(default)]
    challenge: ChallengeFilter,

    /// Outgoing challenge queue.
    #[serde(default)]
    outgoing: OutgoingConfig,

    /// Automatic opponent seeking.
    #[serde(default)]
    matchmaking: MatchmakingConfig,
}

#[instrument]
fn default_url() -> String {
    "https://lichess.org".to_string()
}

#[instrument]
fn default_max_games() -> usize {
    1
}

impl BotConfig {
    /// Creates a configuration with defaults around an engine command.
    #[instrument(skip(command))]
    pub fn new(command: Vec<String>) -> Self {
        Self {
            token: None,
            url: default_url(),
            max_games: default_max_games(),
            overflow_policy: OverflowPolicy::default(),
            engine: EngineConfig::new(command),
            timing: TimingConfig::default(),
            stream: StreamConfig::default(),
            challenge: ChallengeFilter::default(),
            outgoing: OutgoingConfig::default(),
            matchmaking: MatchmakingConfig::default(),
        }
    }

    /// Loads configuration from TOML file.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        debug!("Loading config from file");
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("Failed to read config file: {}", e)))?;

        let config = Self::from_toml(&content)?;
        info!(max_games = config.max_games, engine = ?config.engine.command, "Config loaded successfully");
        Ok(config)
    }

    /// Parses and validates a TOML document.
    #[instrument(skip(content))]
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::new(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values serde cannot check.
    #[instrument(skip(self))]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_games == 0 {
            return Err(ConfigError::new("max_games must be at least 1"));
        }
        if self.engine.command.is_empty() {
            return Err(ConfigError::new("engine.command must not be empty"));
        }
        if self.timing.move_now_threshold_ms <= self.timing.move_overhead_ms {
            return Err(ConfigError::new(
                "timing.move_now_threshold_ms must exceed timing.move_overhead_ms",
            ));
        }
        if self.stream.backoff.max_attempts == 0 {
            return Err(ConfigError::new("stream.backoff.max_attempts must be at least 1"));
        }
        let mm = &self.matchmaking;
        if mm.initial_rating_diff > mm.max_rating_diff {
            return Err(ConfigError::new(
                "matchmaking.initial_rating_diff must not exceed matchmaking.max_rating_diff",
            ));
        }
        Ok(())
    }

    /// Resolves the token: explicit override, then environment, then file.
    #[instrument(skip_all)]
    pub fn resolve_token(&self, explicit: Option<String>) -> Result<String, ConfigError> {
        let usable = |token: &String| !token.trim().is_empty();
        explicit
            .filter(usable)
            .or_else(|| std::env::var(TOKEN_ENV).ok().filter(usable))
            .or_else(|| self.token.clone().filter(usable))
            .ok_or_else(|| ConfigError::new(format!("No API token: set {} or the token key", TOKEN_ENV)))
    }

    /// Replaces the concurrency ceiling.
    pub fn with_max_games(mut self, max_games: usize) -> Self {
        self.max_games = max_games;
        self
    }

    /// Replaces the overflow policy.
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Replaces the timing section.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Replaces the stream section.
    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    /// Replaces the incoming challenge filter.
    pub fn with_challenge(mut self, challenge: ChallengeFilter) -> Self {
        self.challenge = challenge;
        self
    }

    /// Replaces the outgoing queue section.
    pub fn with_outgoing(mut self, outgoing: OutgoingConfig) -> Self {
        self.outgoing = outgoing;
        self
    }

    /// Replaces the matchmaking section.
    pub fn with_matchmaking(mut self, matchmaking: MatchmakingConfig) -> Self {
        self.matchmaking = matchmaking;
        self
    }
}

/// Engine process settings.
#[derive(Debug, Clone, Getters, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Program and arguments.
    command: Vec<String>,

    /// Working directory of the process.
    #[serde(default)]
    working_dir: Option<PathBuf>,

    /// UCI options sent after the handshake.
    #[serde(default)]
    options: BTreeMap<String, String>,

    /// Limit for `uci`/`isready` round trips.
    #[serde(default = "default_handshake_timeout_ms")]
    handshake_timeout_ms: u64,

    /// Extra time past the budget before the engine is killed.
    #[serde(default = "default_grace_ms")]
    grace_ms: u64,

    /// Time allowed for an orderly `quit`.
    #[serde(default = "default_quit_timeout_ms")]
    quit_timeout_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_grace_ms() -> u64 {
    1_000
}

fn default_quit_timeout_ms() -> u64 {
    2_000
}

impl EngineConfig {
    /// Creates engine settings with default timeouts.
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            working_dir: None,
            options: BTreeMap::new(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            grace_ms: default_grace_ms(),
            quit_timeout_ms: default_quit_timeout_ms(),
        }
    }

    /// Handshake limit.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Grace period past the move budget.
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Orderly shutdown limit.
    pub fn quit_timeout(&self) -> Duration {
        Duration::from_millis(self.quit_timeout_ms)
    }
}

/// Clock handling and session timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Safety margin subtracted from our clock for network latency.
    pub move_overhead_ms: u64,
    /// Remaining clock at which the engine is told to move now.
    pub move_now_threshold_ms: u64,
    /// Think time for games without a clock.
    pub unlimited_move_time_ms: u64,
    /// Wait for the opponent's first move before aborting.
    pub abort_timeout_secs: u64,
    /// Plies below which an ended game counts as aborted.
    pub min_ply_for_result: usize,
    /// Time running games get to finish naturally on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            move_overhead_ms: 500,
            move_now_threshold_ms: 1_000,
            unlimited_move_time_ms: 10_000,
            abort_timeout_secs: 30,
            min_ply_for_result: 2,
            shutdown_grace_secs: 60,
        }
    }
}

impl TimingConfig {
    /// Latency margin.
    pub fn move_overhead(&self) -> Duration {
        Duration::from_millis(self.move_overhead_ms)
    }

    /// Move-now threshold.
    pub fn move_now_threshold(&self) -> Duration {
        Duration::from_millis(self.move_now_threshold_ms)
    }

    /// Think time without a clock.
    pub fn unlimited_move_time(&self) -> Duration {
        Duration::from_millis(self.unlimited_move_time_ms)
    }

    /// First-move abort timeout.
    pub fn abort_timeout(&self) -> Duration {
        Duration::from_secs(self.abort_timeout_secs)
    }

    /// Shutdown grace.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Event and game stream handling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Silence after which a stream counts as dead.
    pub heartbeat_timeout_secs: u64,
    /// Window in which repeated events are dropped.
    pub dedup_window_secs: u64,
    /// Reconnect curve for the account event stream.
    pub backoff: BackoffConfig,
    /// Reconnect curve for a game stream.
    pub game_backoff: BackoffConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 20,
            dedup_window_secs: 60,
            backoff: BackoffConfig::default(),
            game_backoff: BackoffConfig {
                initial_ms: 500,
                max_ms: 8_000,
                multiplier: 2.0,
                jitter: 0.2,
                max_attempts: 5,
            },
        }
    }
}

impl StreamConfig {
    /// Heartbeat timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Dedup window.
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

/// Filters applied to incoming challenges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeFilter {
    /// Accepted variants.
    pub variants: Vec<Variant>,
    /// Accepted speeds.
    pub speeds: Vec<Speed>,
    /// Shortest accepted initial time in seconds.
    pub min_initial_secs: Option<u64>,
    /// Longest accepted initial time in seconds.
    pub max_initial_secs: Option<u64>,
    /// Smallest accepted increment in seconds.
    pub min_increment_secs: Option<u64>,
    /// Largest accepted increment in seconds.
    pub max_increment_secs: Option<u64>,
    /// Accept rated games.
    pub allow_rated: bool,
    /// Accept casual games.
    pub allow_casual: bool,
    /// Accept bot challengers.
    pub allow_bots: bool,
    /// Accept human challengers.
    pub allow_humans: bool,
    /// Lowest challenger rating.
    pub min_rating: Option<i32>,
    /// Highest challenger rating.
    pub max_rating: Option<i32>,
    /// Users always declined.
    pub blacklist: Vec<String>,
    /// When non-empty, the only users accepted.
    pub whitelist: Vec<String>,
    /// How long an accepted challenge holds a game slot.
    pub accept_timeout_secs: u64,
}

impl Default for ChallengeFilter {
    fn default() -> Self {
        Self {
            variants: vec![Variant::Standard],
            speeds: vec![Speed::Bullet, Speed::Blitz, Speed::Rapid, Speed::Classical],
            min_initial_secs: None,
            max_initial_secs: None,
            min_increment_secs: None,
            max_increment_secs: None,
            allow_rated: true,
            allow_casual: true,
            allow_bots: true,
            allow_humans: true,
            min_rating: None,
            max_rating: None,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            accept_timeout_secs: 30,
        }
    }
}

impl ChallengeFilter {
    /// Slot reservation timeout for accepted challenges.
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }
}

/// Outgoing challenge queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutgoingConfig {
    /// Minimum time between two challenges to the same user.
    pub cooldown_secs: u64,
    /// Retry curve; `max_attempts` bounds the retries of one entry.
    pub backoff: BackoffConfig,
}

impl Default for OutgoingConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30,
            backoff: BackoffConfig {
                initial_ms: 5_000,
                max_ms: 120_000,
                multiplier: 2.0,
                jitter: 0.1,
                max_attempts: 3,
            },
        }
    }
}

impl OutgoingConfig {
    /// Per-user cool-down.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// One matchmaking flavor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchmakingType {
    /// Clock, e.g. `"3+2"`.
    pub time_control: TimeControl,
    /// Variant.
    #[serde(default)]
    pub variant: Variant,
    /// Rated or casual.
    #[serde(default = "default_rated")]
    pub rated: bool,
    /// Color preference.
    #[serde(default)]
    pub color: ChallengeColor,
}

fn default_rated() -> bool {
    true
}

/// Automatic opponent seeking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    /// Time between matchmaking cycles while idle.
    pub interval_secs: u64,
    /// Opponents played or declined within this window are skipped.
    pub recent_opponent_window_secs: u64,
    /// Starting search radius around our rating.
    pub initial_rating_diff: i32,
    /// Radius growth after a cycle without candidates.
    pub rating_diff_step: i32,
    /// Radius cap.
    pub max_rating_diff: i32,
    /// Number of online bots fetched per cycle.
    pub pool_size: usize,
    /// Flavors, cycled round-robin.
    pub types: Vec<MatchmakingType>,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            recent_opponent_window_secs: 3_600,
            initial_rating_diff: 100,
            rating_diff_step: 100,
            max_rating_diff: 500,
            pool_size: 100,
            types: Vec::new(),
        }
    }
}

impl MatchmakingConfig {
    /// Cycle interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Recent-opponent window.
    pub fn recent_opponent_window(&self) -> Duration {
        Duration::from_secs(self.recent_opponent_window_secs)
    }
}

/// Configuration error.
#[derive(Debug, Clone, Display, Error)]
#[display("Config error: {} at {}:{}", message, file, line)]
pub struct ConfigError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[track_caller]
    #[instrument(skip(message))]
    pub fn new(message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            message: message.into(),
            line: loc.line(),
            file: loc.file(),
        }
    }
}
