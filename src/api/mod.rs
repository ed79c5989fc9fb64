//! Remote service boundary.
//!
//! Everything the bot needs from the game server goes through
//! [`RemoteService`], so the rest of the crate never touches HTTP.

mod lichess;
mod ndjson;

pub use lichess::LichessApi;
pub use ndjson::decode_ndjson;

use futures::stream::BoxStream;

use crate::{
    Account, BotError, ChallengeId, ChallengeOutcome, ChallengeRequest, DeclineReason, Event, GameEvent, GameId,
};

/// Account event stream.
pub type EventStream = BoxStream<'static, Result<Event, BotError>>;

/// Game state stream of one game.
pub type GameStream = BoxStream<'static, Result<GameEvent, BotError>>;

/// Typed calls over the server API.
#[async_trait::async_trait]
pub trait RemoteService: Send + Sync {
    /// Opens the account event stream.
    async fn stream_events(&self) -> Result<EventStream, BotError>;

    /// Fetches our own profile.
    async fn get_account(&self) -> Result<Account, BotError>;

    /// Turns the account into a bot account. Irreversible.
    async fn upgrade_to_bot(&self) -> Result<(), BotError>;

    /// Accepts an incoming challenge.
    async fn accept_challenge(&self, id: &ChallengeId) -> Result<(), BotError>;

    /// Declines an incoming challenge.
    async fn decline_challenge(&self, id: &ChallengeId, reason: DeclineReason) -> Result<(), BotError>;

    /// Sends a challenge and waits for the opponent's answer.
    async fn create_challenge(&self, request: &ChallengeRequest) -> Result<ChallengeOutcome, BotError>;

    /// Withdraws one of our challenges.
    async fn cancel_challenge(&self, id: &ChallengeId) -> Result<(), BotError>;

    /// Opens the state stream of a game.
    async fn stream_game_state(&self, id: &GameId) -> Result<GameStream, BotError>;

    /// Plays a move in UCI notation.
    async fn make_move(&self, id: &GameId, uci: &str, offer_draw: bool) -> Result<(), BotError>;

    /// Resigns a game.
    async fn resign(&self, id: &GameId) -> Result<(), BotError>;

    /// Aborts a game before both sides moved.
    async fn abort(&self, id: &GameId) -> Result<(), BotError>;

    /// Claims the win after the opponent left.
    async fn claim_victory(&self, id: &GameId) -> Result<(), BotError>;

    /// Joins a tournament.
    async fn join_tournament(&self, id: &str, team: Option<&str>, password: Option<&str>) -> Result<(), BotError>;

    /// Leaves a tournament.
    async fn withdraw_tournament(&self, id: &str) -> Result<(), BotError>;

    /// Lists bots currently online.
    async fn online_bots(&self, limit: usize) -> Result<Vec<Account>, BotError>;
}
