//! Server-side data model: identifiers, time controls, events and game states.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use strum::{EnumIter, EnumString};
use tracing::instrument;

use crate::BotError;

/// Server-assigned game identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(String);

impl GameId {
    /// Creates a game id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Server-assigned challenge identifier.
///
/// An accepted challenge starts a game with the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChallengeId(String);

impl ChallengeId {
    /// Creates a challenge id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of the game this challenge turns into once accepted.
    pub fn game_id(&self) -> GameId {
        GameId(self.0.clone())
    }
}

/// Side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Color {
    /// White pieces.
    #[display("white")]
    White,
    /// Black pieces.
    #[display("black")]
    Black,
}

impl Color {
    /// The other side.
    pub fn opposite(self) -> Self {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }
}

/// Color preference for an outgoing challenge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChallengeColor {
    /// We play white.
    White,
    /// We play black.
    Black,
    /// Server decides.
    #[default]
    Random,
}

/// Game variant, keyed like the server keys it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, EnumIter, strum::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase", ascii_case_insensitive)]
pub enum Variant {
    /// Standard chess.
    #[default]
    Standard,
    /// Fischer random.
    Chess960,
    /// Crazyhouse.
    Crazyhouse,
    /// Antichess.
    Antichess,
    /// Atomic.
    Atomic,
    /// Horde.
    Horde,
    /// King of the hill.
    KingOfTheHill,
    /// Racing kings.
    RacingKings,
    /// Three-check.
    ThreeCheck,
    /// Standard rules from a custom position.
    FromPosition,
}

impl Variant {
    /// Name an engine expects in `UCI_Variant`, `None` for standard rules.
    pub fn uci_name(self) -> Option<&'static str> {
        match self {
            Variant::Standard | Variant::FromPosition | Variant::Chess960 => None,
            Variant::Crazyhouse => Some("crazyhouse"),
            Variant::Antichess => Some("antichess"),
            Variant::Atomic => Some("atomic"),
            Variant::Horde => Some("horde"),
            Variant::KingOfTheHill => Some("kingofthehill"),
            Variant::RacingKings => Some("racingkings"),
            Variant::ThreeCheck => Some("3check"),
        }
    }
}

/// Time-control class of a game.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumString, strum::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase", ascii_case_insensitive)]
pub enum Speed {
    /// Estimated duration under 30 seconds.
    UltraBullet,
    /// Under 3 minutes.
    Bullet,
    /// Under 8 minutes.
    Blitz,
    /// Under 25 minutes.
    Rapid,
    /// Anything longer with a clock.
    Classical,
    /// Days per move.
    Correspondence,
}

/// Rating bucket used to scope matchmaking and rating lookups.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumString, strum::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase", ascii_case_insensitive)]
pub enum PerfType {
    /// Standard ultrabullet.
    UltraBullet,
    /// Standard bullet.
    Bullet,
    /// Standard blitz.
    Blitz,
    /// Standard rapid.
    Rapid,
    /// Standard classical.
    Classical,
    /// Correspondence.
    Correspondence,
    /// Chess960, any speed.
    Chess960,
    /// Crazyhouse, any speed.
    Crazyhouse,
    /// Antichess, any speed.
    Antichess,
    /// Atomic, any speed.
    Atomic,
    /// Horde, any speed.
    Horde,
    /// King of the hill, any speed.
    KingOfTheHill,
    /// Racing kings, any speed.
    RacingKings,
    /// Three-check, any speed.
    ThreeCheck,
}

impl PerfType {
    /// Bucket for a game of `variant` at `speed`.
    pub fn new(variant: Variant, speed: Speed) -> Self {
        match variant {
            Variant::Standard | Variant::FromPosition => match speed {
                Speed::UltraBullet => PerfType::UltraBullet,
                Speed::Bullet => PerfType::Bullet,
                Speed::Blitz => PerfType::Blitz,
                Speed::Rapid => PerfType::Rapid,
                Speed::Classical => PerfType::Classical,
                Speed::Correspondence => PerfType::Correspondence,
            },
            Variant::Chess960 => PerfType::Chess960,
            Variant::Crazyhouse => PerfType::Crazyhouse,
            Variant::Antichess => PerfType::Antichess,
            Variant::Atomic => PerfType::Atomic,
            Variant::Horde => PerfType::Horde,
            Variant::KingOfTheHill => PerfType::KingOfTheHill,
            Variant::RacingKings => PerfType::RacingKings,
            Variant::ThreeCheck => PerfType::ThreeCheck,
        }
    }
}

/// Clock settings of a real-time game.
///
/// Serialized as `"minutes+seconds"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeControl {
    /// Starting time per side.
    pub initial: Duration,
    /// Time added after each move.
    pub increment: Duration,
}

impl TimeControl {
    /// Creates a time control from whole seconds.
    pub fn from_secs(initial: u64, increment: u64) -> Self {
        Self {
            initial: Duration::from_secs(initial),
            increment: Duration::from_secs(increment),
        }
    }

    /// Speed class, from the estimated game duration `initial + 40 * increment`.
    pub fn speed(&self) -> Speed {
        let estimate = self
            .initial
            .as_secs()
            .saturating_add(self.increment.as_secs().saturating_mul(40));
        match estimate {
            0..30 => Speed::UltraBullet,
            30..180 => Speed::Bullet,
            180..480 => Speed::Blitz,
            480..1500 => Speed::Rapid,
            _ => Speed::Classical,
        }
    }
}

impl fmt::Display for TimeControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.initial.as_secs();
        if secs % 60 == 0 {
            write!(f, "{}+{}", secs / 60, self.increment.as_secs())
        } else {
            write!(f, "{}+{}", secs as f64 / 60.0, self.increment.as_secs())
        }
    }
}

impl FromStr for TimeControl {
    type Err = BotError;

    /// Parses `"minutes+seconds"`, e.g. `"5+3"` or `"0.5+0"`.
    #[instrument]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (minutes, increment) = s
            .split_once('+')
            .ok_or_else(|| BotError::protocol(format!("Time control must look like 5+3, got {}", s)))?;

        let minutes: f64 = minutes
            .trim()
            .parse()
            .map_err(|_| BotError::protocol(format!("Invalid initial minutes in {}", s)))?;
        let increment: u64 = increment
            .trim()
            .parse()
            .map_err(|_| BotError::protocol(format!("Invalid increment seconds in {}", s)))?;

        let initial = Duration::try_from_secs_f64(minutes * 60.0)
            .map_err(|_| BotError::protocol(format!("Initial time out of range in {}", s)))?;

        Ok(Self {
            initial,
            increment: Duration::from_secs(increment),
        })
    }
}

impl TryFrom<String> for TimeControl {
    type Error = BotError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeControl> for String {
    fn from(value: TimeControl) -> Self {
        value.to_string()
    }
}

/// Who an outgoing challenge is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Opponent {
    /// A specific user.
    User(String),
    /// An open challenge anyone can accept.
    Open,
}

impl fmt::Display for Opponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opponent::User(name) => f.write_str(name),
            Opponent::Open => f.write_str("open"),
        }
    }
}

/// An outgoing challenge, immutable once queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    /// Target of the challenge.
    pub opponent: Opponent,
    /// Clock settings.
    pub time_control: TimeControl,
    /// Color we ask for.
    pub color: ChallengeColor,
    /// Rated or casual.
    pub rated: bool,
    /// Variant to play.
    pub variant: Variant,
}

impl ChallengeRequest {
    /// Creates a casual standard challenge with random colors.
    pub fn new(opponent: Opponent, time_control: TimeControl) -> Self {
        Self {
            opponent,
            time_control,
            color: ChallengeColor::Random,
            rated: false,
            variant: Variant::Standard,
        }
    }

    /// Sets the color preference.
    pub fn with_color(mut self, color: ChallengeColor) -> Self {
        self.color = color;
        self
    }

    /// Sets the rated flag.
    pub fn with_rated(mut self, rated: bool) -> Self {
        self.rated = rated;
        self
    }

    /// Sets the variant.
    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    /// Rating bucket this challenge plays in.
    pub fn perf_type(&self) -> PerfType {
        PerfType::new(self.variant, self.time_control.speed())
    }

    /// Expands into `count` color-swapped pairs: white then black, repeated.
    pub fn pairs(&self, count: usize) -> Vec<ChallengeRequest> {
        (0..count)
            .flat_map(|_| {
                [
                    self.clone().with_color(ChallengeColor::White),
                    self.clone().with_color(ChallengeColor::Black),
                ]
            })
            .collect()
    }
}

/// Result of an outgoing challenge as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// The opponent accepted; a game with the same id starts.
    Accepted(ChallengeId),
    /// An open challenge was created and waits for anyone.
    Created(ChallengeId),
    /// The opponent declined.
    Declined {
        /// Challenge id.
        id: ChallengeId,
        /// Reason given by the server, if any.
        reason: Option<String>,
    },
    /// Nobody answered before the server dropped the challenge.
    Expired(ChallengeId),
    /// The server refused to create more challenges for now.
    RateLimited,
}

/// Reason attached to a declined challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum DeclineReason {
    /// No specific reason.
    Generic,
    /// Not now.
    Later,
    /// Clock too short.
    TooFast,
    /// Clock too long.
    TooSlow,
    /// Time control not accepted.
    TimeControl,
    /// Rated games not accepted.
    Rated,
    /// Casual games not accepted.
    Casual,
    /// Only standard chess.
    Standard,
    /// Variant not accepted.
    Variant,
    /// Bots not accepted.
    NoBot,
    /// Only bots accepted.
    OnlyBot,
}

/// Rating summary for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfStats {
    /// Current rating. Puzzle-like entries carry none.
    #[serde(default)]
    pub rating: i32,
    /// Number of rated games played.
    #[serde(default)]
    pub games: u32,
    /// Whether the rating is provisional.
    #[serde(default)]
    pub prov: bool,
}

/// Public profile of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Lowercase id.
    pub id: String,
    /// Display name.
    pub username: String,
    /// Title, `BOT` for bot accounts.
    #[serde(default)]
    pub title: Option<String>,
    /// Ratings keyed by perf type.
    #[serde(default)]
    pub perfs: HashMap<String, PerfStats>,
    /// Whether the account is closed.
    #[serde(default)]
    pub disabled: bool,
    /// Whether the account is flagged.
    #[serde(default, rename = "tosViolation")]
    pub tos_violation: bool,
}

impl Account {
    /// Rating in `perf`, if the account has played it.
    pub fn rating(&self, perf: PerfType) -> Option<i32> {
        self.perfs.get(&perf.to_string()).map(|stats| stats.rating)
    }

    /// Whether this is a bot account.
    pub fn is_bot(&self) -> bool {
        self.title.as_deref() == Some("BOT")
    }
}

/// A user as embedded in challenges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeUser {
    /// Lowercase id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Rating in the challenge's perf type.
    #[serde(default)]
    pub rating: Option<i32>,
    /// Title, `BOT` for bot accounts.
    #[serde(default)]
    pub title: Option<String>,
}

impl ChallengeUser {
    /// Whether this is a bot account.
    pub fn is_bot(&self) -> bool {
        self.title.as_deref() == Some("BOT")
    }
}

/// Variant wrapper as sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantInfo {
    /// Variant key.
    pub key: Variant,
}

/// Clock settings attached to a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChallengeTimeControl {
    /// Real-time clock.
    Clock {
        /// Initial seconds.
        limit: u64,
        /// Increment seconds.
        increment: u64,
    },
    /// Days per move.
    Correspondence {
        /// Days allowed per move.
        #[serde(rename = "daysPerTurn")]
        days_per_turn: u32,
    },
    /// No clock.
    Unlimited,
}

impl ChallengeTimeControl {
    /// The real-time clock, if any.
    pub fn clock(&self) -> Option<TimeControl> {
        match self {
            ChallengeTimeControl::Clock { limit, increment } => Some(TimeControl::from_secs(*limit, *increment)),
            _ => None,
        }
    }
}

/// An incoming (or our own echoed) challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    /// Challenge id.
    pub id: ChallengeId,
    /// Who sent it. Absent for anonymous open challenges.
    #[serde(default)]
    pub challenger: Option<ChallengeUser>,
    /// Who it is addressed to.
    #[serde(default)]
    pub dest_user: Option<ChallengeUser>,
    /// Variant.
    pub variant: VariantInfo,
    /// Rated or casual.
    #[serde(default)]
    pub rated: bool,
    /// Speed class.
    pub speed: Speed,
    /// Clock settings.
    pub time_control: ChallengeTimeControl,
    /// Color the challenger asked for.
    #[serde(default)]
    pub color: ChallengeColor,
}

/// Opponent as described in a game-start notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOpponent {
    /// Lowercase id, absent for anonymous players.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    pub username: String,
    /// Rating in this game's perf type.
    #[serde(default)]
    pub rating: Option<i32>,
}

/// Game-start / game-finish notification from the account event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStart {
    /// Game id.
    pub game_id: GameId,
    /// Our color.
    #[serde(default)]
    pub color: Option<Color>,
    /// Opponent.
    pub opponent: GameOpponent,
    /// Variant.
    pub variant: VariantInfo,
    /// Speed class.
    pub speed: Speed,
    /// Rated or casual.
    #[serde(default)]
    pub rated: bool,
    /// Origin, e.g. `friend`, `arena`, `lobby`.
    #[serde(default)]
    pub source: Option<String>,
}

/// Account-level event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// A game began.
    GameStart {
        /// Game details.
        game: GameStart,
    },
    /// A game ended.
    GameFinish {
        /// Game details.
        game: GameStart,
    },
    /// A challenge was sent to us (or by us).
    Challenge {
        /// Challenge details.
        challenge: Challenge,
    },
    /// A challenge was withdrawn by its sender.
    ChallengeCanceled {
        /// Challenge details.
        challenge: Challenge,
    },
    /// A challenge was declined.
    ChallengeDeclined {
        /// Challenge details.
        challenge: Challenge,
    },
    /// Keep-alive line; never sent as JSON.
    #[serde(skip)]
    Heartbeat,
    /// Anything we do not act on.
    #[serde(other)]
    Other,
}

/// Server-side game status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum GameStatus {
    /// Created, not started.
    Created,
    /// In progress.
    Started,
    /// Aborted before both sides moved.
    Aborted,
    /// Checkmate.
    Mate,
    /// Resignation.
    Resign,
    /// Stalemate.
    Stalemate,
    /// Opponent left and the win was claimed.
    Timeout,
    /// Draw.
    Draw,
    /// Flag fall.
    Outoftime,
    /// Cheat detected.
    Cheat,
    /// A player did not make the first move.
    NoStart,
    /// Ended for an unknown reason.
    UnknownFinish,
    /// Variant-specific ending.
    VariantEnd,
    /// Any status this client does not know.
    #[serde(other)]
    Unknown,
}

impl GameStatus {
    /// Whether the game is still being played.
    pub fn is_ongoing(self) -> bool {
        matches!(self, GameStatus::Created | GameStatus::Started)
    }

    /// Whether the game ended without a result.
    pub fn is_abort(self) -> bool {
        matches!(self, GameStatus::Aborted | GameStatus::NoStart)
    }
}

/// A player of a game as described in `gameFull`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamePlayer {
    /// Lowercase id, absent for anonymous players and AI.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Rating.
    #[serde(default)]
    pub rating: Option<i32>,
    /// Title.
    #[serde(default)]
    pub title: Option<String>,
    /// Level of the server AI, when playing it.
    #[serde(default, rename = "aiLevel")]
    pub ai_level: Option<u8>,
}

impl GamePlayer {
    /// Name shown in logs.
    pub fn display_name(&self) -> String {
        match (&self.name, self.ai_level) {
            (Some(name), _) => name.clone(),
            (None, Some(level)) => format!("AI level {}", level),
            (None, None) => "anonymous".to_string(),
        }
    }
}

/// Clock settings in milliseconds, as sent in `gameFull`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameClock {
    /// Initial milliseconds.
    pub initial: u64,
    /// Increment milliseconds.
    pub increment: u64,
}

/// Position update of a running game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    /// All moves since the initial position, space separated UCI.
    #[serde(default)]
    pub moves: String,
    /// White's remaining milliseconds.
    #[serde(default)]
    pub wtime: u64,
    /// Black's remaining milliseconds.
    #[serde(default)]
    pub btime: u64,
    /// White's increment milliseconds.
    #[serde(default)]
    pub winc: u64,
    /// Black's increment milliseconds.
    #[serde(default)]
    pub binc: u64,
    /// Game status.
    pub status: GameStatus,
    /// Winner, when decided.
    #[serde(default)]
    pub winner: Option<Color>,
    /// White offers a draw.
    #[serde(default)]
    pub wdraw: bool,
    /// Black offers a draw.
    #[serde(default)]
    pub bdraw: bool,
}

impl GameState {
    /// Moves as a list.
    pub fn move_list(&self) -> Vec<String> {
        self.moves.split_whitespace().map(str::to_string).collect()
    }

    /// Remaining clock of `color`.
    pub fn time_of(&self, color: Color) -> Duration {
        match color {
            Color::White => Duration::from_millis(self.wtime),
            Color::Black => Duration::from_millis(self.btime),
        }
    }
}

/// Full description of a game, first message of a game stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameFull {
    /// Game id.
    pub id: GameId,
    /// Variant.
    pub variant: VariantInfo,
    /// Clock, absent for correspondence and unlimited games.
    #[serde(default)]
    pub clock: Option<GameClock>,
    /// Speed class.
    pub speed: Speed,
    /// Rated or casual.
    #[serde(default)]
    pub rated: bool,
    /// White player.
    pub white: GamePlayer,
    /// Black player.
    pub black: GamePlayer,
    /// Starting FEN or `startpos`.
    #[serde(default = "default_initial_fen")]
    pub initial_fen: String,
    /// Current state.
    pub state: GameState,
}

fn default_initial_fen() -> String {
    "startpos".to_string()
}

impl GameFull {
    /// Whether white moves first from the initial position.
    pub fn white_starts(&self) -> bool {
        if self.initial_fen == "startpos" {
            return true;
        }
        self.initial_fen.split_whitespace().nth(1) != Some("b")
    }
}

/// Message of a game stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GameEvent {
    /// Full game description.
    GameFull(Box<GameFull>),
    /// Position update.
    GameState(GameState),
    /// Opponent left the game.
    #[serde(rename_all = "camelCase")]
    OpponentGone {
        /// Whether the opponent is gone.
        gone: bool,
        /// Seconds until a win can be claimed.
        #[serde(default)]
        claim_win_in_seconds: Option<u64>,
    },
    /// Chat message.
    ChatLine {
        /// Sender.
        username: String,
        /// Message.
        text: String,
    },
    /// Anything we do not act on.
    #[serde(other)]
    Other,
}
