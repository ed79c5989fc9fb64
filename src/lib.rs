//! botli - unattended chess bot for the Lichess Bot API
//!
//! The bot consumes the account event stream, accepts or declines incoming
//! challenges, sends its own, and plays every game by driving a UCI engine.
//!
//! # Architecture
//!
//! - **Event handler**: reads the event stream, reconnects with backoff,
//!   drops duplicates and routes events
//! - **Game manager**: actor owning the sessions and challenge queues
//! - **Game session**: per-game state machine
//! - **Engine bridge**: one UCI engine process per game
//! - **Remote service**: typed calls over the server API
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use botli::{Bot, BotConfig, LichessApi, ProcessLauncher};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = BotConfig::from_file("config.toml")?;
//! let token = config.resolve_token(None)?;
//! let api = Arc::new(LichessApi::new(config.url(), &token)?);
//! let launcher = Arc::new(ProcessLauncher::new(config.engine().clone()));
//!
//! let bot = Bot::start(config, api, launcher, false).await?;
//! bot.manager().request_matchmaking(None).await?;
//! bot.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

// Private module declarations
mod api;
mod backoff;
mod bot;
mod challenge;
mod config;
mod console;
mod engine;
mod error;
mod events;
mod manager;
mod model;
mod session;

// Crate-level exports - Errors
pub use error::{BotError, ErrorKind};

// Crate-level exports - Configuration
pub use backoff::{Backoff, BackoffConfig};
pub use config::{
    BotConfig, ChallengeFilter, ConfigError, EngineConfig, MatchmakingConfig, MatchmakingType, OutgoingConfig,
    OverflowPolicy, StreamConfig, TOKEN_ENV, TimingConfig,
};

// Crate-level exports - Data model
pub use model::{
    Account, Challenge, ChallengeColor, ChallengeId, ChallengeOutcome, ChallengeRequest, ChallengeTimeControl,
    ChallengeUser, Color, DeclineReason, Event, GameClock, GameEvent, GameFull, GameId, GameOpponent, GamePlayer,
    GameStart, GameState, GameStatus, Opponent, PerfStats, PerfType, Speed, TimeControl, Variant, VariantInfo,
};

// Crate-level exports - Remote service
pub use api::{EventStream, GameStream, LichessApi, RemoteService, decode_ndjson};

// Crate-level exports - Engine bridge
pub use engine::{
    BridgeState, EngineBridge, EngineClock, EngineLauncher, EngineMove, ProcessLauncher, SearchLimits, ceil_millis,
};

// Crate-level exports - Sessions and supervision
pub use challenge::{ChallengeDecision, ChallengeValidator};
pub use events::{DedupWindow, EventControl, EventHandler, EventHandlerHandle, EventKind, EventRecord};
pub use manager::{
    ChallengeOrigin, ChallengeQueue, GameManager, ManagerCommand, ManagerHandle, ManagerStatus, Matchmaking,
    QueuedChallenge, RetryVerdict,
};
pub use session::{GameSession, SessionContext, SessionReport, SessionState, ShutdownMode, search_limits};

// Crate-level exports - Shell
pub use bot::{Bot, RunningBot};
pub use console::{ConsoleCommand, ConsoleError, HELP};
