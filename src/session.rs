//! Per-game state machine.
//!
//! A [`GameSession`] follows one game from its first `gameFull` to a terminal
//! state. It is the only writer of its own state and the only owner of its
//! engine bridge.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use derive_new::new;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    Backoff, BackoffConfig, BotError, Color, EngineBridge, EngineClock, EngineLauncher, EngineMove, GameEvent,
    GameFull, GameId, GameState, GameStatus, GameStream, RemoteService, SearchLimits, TimingConfig, Variant,
};

/// Lifecycle of a game session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum SessionState {
    /// Waiting for the first position.
    Starting,
    /// Our engine is thinking.
    OurTurn,
    /// Waiting for the opponent.
    TheirTurn,
    /// The server reported the end of the game.
    Ending,
    /// Finished with a result.
    Closed,
    /// Ended before the minimum ply count.
    Aborted,
    /// Ended by an unrecoverable local or network error.
    Failed,
}

impl SessionState {
    /// Whether the session is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Aborted | SessionState::Failed)
    }
}

/// Process-wide shutdown request seen by every session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, derive_more::Display)]
pub enum ShutdownMode {
    /// Play normally.
    #[default]
    Running,
    /// Let games end naturally.
    Finish,
    /// Resign (or abort) and close now.
    Resign,
}

/// Dependencies shared by all sessions.
#[derive(Clone, new)]
pub struct SessionContext {
    /// Server API.
    api: Arc<dyn RemoteService>,
    /// Engine factory.
    launcher: Arc<dyn EngineLauncher>,
    /// Our account id, lowercase.
    username: String,
    /// Clock handling.
    timing: TimingConfig,
    /// Extra time past the budget before the engine is killed.
    grace: Duration,
    /// Reconnect curve for the game stream.
    game_backoff: BackoffConfig,
}

/// Final outcome of a session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Game id.
    pub game_id: GameId,
    /// Opponent name, once known.
    pub opponent: Option<String>,
    /// Terminal state.
    pub state: SessionState,
    /// Server status at the end, if reported.
    pub status: Option<GameStatus>,
    /// Winner, if any.
    pub winner: Option<Color>,
    /// Plies played.
    pub plies: usize,
    /// Cause of a `Failed` session.
    pub error: Option<BotError>,
}

/// What the session learned from `gameFull`.
#[derive(Debug, Clone)]
struct GameInfo {
    color: Color,
    opponent: String,
    variant: Variant,
    initial_fen: String,
    white_starts: bool,
    has_clock: bool,
}

enum Flow {
    Continue,
    Search(SearchLimits),
    Done,
}

/// One item pulled from the game stream.
type StreamItem = Option<Result<GameEvent, BotError>>;

/// State machine of one game.
pub struct GameSession {
    id: GameId,
    ctx: SessionContext,
    shutdown: watch::Receiver<ShutdownMode>,
    state: watch::Sender<SessionState>,
    info: Option<GameInfo>,
    engine: Option<EngineBridge>,
    plies: usize,
    last_submitted_ply: Option<usize>,
    abort_at: Option<Instant>,
    status: Option<GameStatus>,
    winner: Option<Color>,
    error: Option<BotError>,
}

impl GameSession {
    /// Creates a session for `id`.
    pub fn new(id: GameId, ctx: SessionContext, shutdown: watch::Receiver<ShutdownMode>) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            id,
            ctx,
            shutdown,
            state,
            info: None,
            engine: None,
            plies: 0,
            last_submitted_ply: None,
            abort_at: None,
            status: None,
            winner: None,
            error: None,
        }
    }

    /// Observes state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Plays the game to a terminal state.
    #[instrument(skip(self), fields(game_id = %self.id))]
    pub async fn run(mut self) -> SessionReport {
        info!("Session started");

        if let Err(err) = self.play().await {
            error!(error = %err, state = %self.current(), "Session failed");
            self.set_state(SessionState::Failed);
            self.give_up().await;
            self.error = Some(err);
        }

        if let Some(engine) = self.engine.take() {
            engine.quit().await;
        }

        info!(state = %self.current(), plies = self.plies, status = ?self.status, "Session finished");
        SessionReport {
            game_id: self.id,
            opponent: self.info.map(|info| info.opponent),
            state: *self.state.borrow(),
            status: self.status,
            winner: self.winner,
            plies: self.plies,
            error: self.error,
        }
    }

    async fn play(&mut self) -> Result<(), BotError> {
        if *self.shutdown.borrow() == ShutdownMode::Resign {
            info!("Shutdown in progress, not playing");
            self.give_up().await;
            return Ok(());
        }

        let mut stream = self.open_stream().await?;
        let mut shutdown_open = true;
        let mut pending: VecDeque<StreamItem> = VecDeque::new();

        loop {
            if let Some(item) = pending.pop_front() {
                if let Flow::Done = self.on_item(item, &mut stream, &mut pending).await? {
                    return Ok(());
                }
                continue;
            }

            let item = tokio::select! {
                changed = self.shutdown.changed(), if shutdown_open => {
                    if changed.is_err() {
                        shutdown_open = false;
                    } else if *self.shutdown.borrow_and_update() == ShutdownMode::Resign {
                        info!("Shutdown requested, leaving the game");
                        self.give_up().await;
                        return Ok(());
                    }
                    continue;
                }
                _ = sleep_until(self.abort_at.unwrap_or_else(Instant::now)), if self.abort_at.is_some() => {
                    info!("Opponent did not move in time, aborting");
                    self.abort_at = None;
                    self.give_up().await;
                    return Ok(());
                }
                item = stream.next() => item,
            };

            if let Flow::Done = self.on_item(item, &mut stream, &mut pending).await? {
                return Ok(());
            }
        }
    }

    async fn on_item(
        &mut self,
        item: StreamItem,
        stream: &mut GameStream,
        pending: &mut VecDeque<StreamItem>,
    ) -> Result<Flow, BotError> {
        match item {
            Some(Ok(event)) => match self.handle(event).await? {
                Flow::Search(limits) => {
                    if let Some(best) = self.search(&limits, stream, pending).await? {
                        self.play_move(best).await?;
                    }
                    Ok(Flow::Continue)
                }
                flow => Ok(flow),
            },
            Some(Err(err)) if err.is_retryable() => {
                warn!(error = %err, "Game stream failed");
                *stream = self.reopen_stream().await?;
                Ok(Flow::Continue)
            }
            Some(Err(err)) => Err(err),
            None => {
                debug!("Game stream ended before the game did");
                *stream = self.reopen_stream().await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Runs the engine while the game stream keeps being read.
    ///
    /// Updates that arrive meanwhile are queued in `pending`. When one of them
    /// ends the game the search is stopped and `None` is returned.
    async fn search(
        &mut self,
        limits: &SearchLimits,
        stream: &mut GameStream,
        pending: &mut VecDeque<StreamItem>,
    ) -> Result<Option<EngineMove>, BotError> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| BotError::invariant("No engine for our turn"))?;

        {
            let search = engine.go(limits);
            tokio::pin!(search);
            let mut stream_open = true;
            loop {
                tokio::select! {
                    best = &mut search => return best.map(Some),
                    item = stream.next(), if stream_open => {
                        let ends = ends_game(&item);
                        stream_open = matches!(item, Some(Ok(_)));
                        pending.push_back(item);
                        if ends {
                            break;
                        }
                    }
                }
            }
        }

        info!("Game ended while the engine was thinking");
        if let Err(err) = engine.stop().await {
            debug!(error = %err, "Engine did not settle after stop");
        }
        Ok(None)
    }

    async fn play_move(&mut self, best: EngineMove) -> Result<(), BotError> {
        match best {
            EngineMove::Move(uci) => {
                self.submit(&uci).await?;
                self.last_submitted_ply = Some(self.plies);
                self.set_state(SessionState::TheirTurn);
                if self.plies == 0 {
                    self.abort_at = Some(Instant::now() + self.ctx.timing.abort_timeout());
                }
            }
            EngineMove::NoMove => {
                debug!("Engine has no move, waiting for the server to end the game");
            }
        }
        Ok(())
    }

    async fn open_stream(&self) -> Result<GameStream, BotError> {
        let mut backoff = Backoff::new(self.ctx.game_backoff);
        loop {
            match self.ctx.api.stream_game_state(&self.id).await {
                Ok(stream) => return Ok(stream),
                Err(err) if err.is_retryable() => {
                    let delay = backoff.next_delay().ok_or_else(|| {
                        BotError::transient(format!("Game stream unavailable after {} attempts", backoff.attempts()))
                    })?;
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "Retrying game stream");
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn reopen_stream(&self) -> Result<GameStream, BotError> {
        sleep(self.ctx.game_backoff.base_delay(0)).await;
        self.open_stream().await
    }

    async fn handle(&mut self, event: GameEvent) -> Result<Flow, BotError> {
        match event {
            GameEvent::GameFull(full) => {
                if self.info.is_none() {
                    self.setup(&full).await?;
                }
                self.on_state(full.state).await
            }
            GameEvent::GameState(state) => {
                if self.info.is_none() {
                    return Err(BotError::protocol("gameState before gameFull"));
                }
                self.on_state(state).await
            }
            GameEvent::OpponentGone {
                gone: true,
                claim_win_in_seconds,
            } => {
                debug!(claim_win_in_seconds = ?claim_win_in_seconds, "Opponent gone");
                if claim_win_in_seconds == Some(0) {
                    info!("Claiming victory");
                    if let Err(err) = self.ctx.api.claim_victory(&self.id).await {
                        warn!(error = %err, "Failed to claim victory");
                    }
                }
                Ok(Flow::Continue)
            }
            GameEvent::ChatLine { username, text } => {
                debug!(username = %username, text = %text, "Chat");
                Ok(Flow::Continue)
            }
            GameEvent::OpponentGone { .. } | GameEvent::Other => Ok(Flow::Continue),
        }
    }

    #[instrument(skip(self, full))]
    async fn setup(&mut self, full: &GameFull) -> Result<(), BotError> {
        let me = self.ctx.username.to_lowercase();
        let color = if full.white.id.as_deref() == Some(me.as_str()) {
            Color::White
        } else if full.black.id.as_deref() == Some(me.as_str()) {
            Color::Black
        } else {
            return Err(BotError::protocol(format!("{} does not play in this game", me)));
        };

        let opponent = match color {
            Color::White => full.black.display_name(),
            Color::Black => full.white.display_name(),
        };

        let info = GameInfo {
            color,
            opponent,
            variant: full.variant.key,
            initial_fen: full.initial_fen.clone(),
            white_starts: full.white_starts(),
            has_clock: full.clock.is_some(),
        };
        info!(color = %info.color, opponent = %info.opponent, variant = %info.variant, rated = full.rated, "Game set up");

        let mut engine = self.ctx.launcher.launch().await?;
        engine.new_game(info.variant).await?;
        self.engine = Some(engine);
        self.info = Some(info);
        Ok(())
    }

    async fn on_state(&mut self, state: GameState) -> Result<Flow, BotError> {
        let info = self
            .info
            .clone()
            .ok_or_else(|| BotError::invariant("Position update before setup"))?;
        let moves = state.move_list();
        self.plies = moves.len();

        if !state.status.is_ongoing() {
            self.set_state(SessionState::Ending);
            self.status = Some(state.status);
            self.winner = state.winner;
            let terminal = if state.status.is_abort() || self.plies < self.ctx.timing.min_ply_for_result {
                SessionState::Aborted
            } else {
                SessionState::Closed
            };
            info!(status = %state.status, winner = ?state.winner, "Game ended");
            self.set_state(terminal);
            return Ok(Flow::Done);
        }

        let white_to_move = (self.plies % 2 == 0) == info.white_starts;
        let to_move = if white_to_move { Color::White } else { Color::Black };

        if to_move != info.color {
            self.set_state(SessionState::TheirTurn);
            if self.plies >= 2 {
                self.abort_at = None;
            } else if self.abort_at.is_none() {
                self.abort_at = Some(Instant::now() + self.ctx.timing.abort_timeout());
            }
            return Ok(Flow::Continue);
        }

        self.abort_at = None;
        if self.last_submitted_ply == Some(self.plies) {
            debug!(ply = self.plies, "Move already submitted for this position");
            return Ok(Flow::Continue);
        }

        self.set_state(SessionState::OurTurn);
        let limits = search_limits(&state, info.color, info.has_clock, &self.ctx.timing, self.ctx.grace);

        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| BotError::invariant("No engine for our turn"))?;
        engine.set_position(&info.initial_fen, &moves).await?;
        Ok(Flow::Search(limits))
    }

    #[instrument(skip(self))]
    async fn submit(&self, uci: &str) -> Result<(), BotError> {
        match self.ctx.api.make_move(&self.id, uci, false).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "Move submission failed, retrying once");
                self.ctx.api.make_move(&self.id, uci, false).await
            }
            Err(err) => Err(err),
        }
    }

    /// Best-effort abort or resignation so the server never keeps a game we left.
    async fn give_up(&mut self) {
        let result = if self.plies < self.ctx.timing.min_ply_for_result {
            info!(plies = self.plies, "Aborting game");
            if self.current() != SessionState::Failed {
                self.set_state(SessionState::Aborted);
            }
            self.ctx.api.abort(&self.id).await
        } else {
            info!(plies = self.plies, "Resigning game");
            if self.current() != SessionState::Failed {
                self.set_state(SessionState::Closed);
            }
            self.ctx.api.resign(&self.id).await
        };

        if let Err(err) = result {
            warn!(error = %err, "Server rejected abort/resign");
        }
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Session state changed");
        }
    }
}

fn ends_game(item: &StreamItem) -> bool {
    match item {
        Some(Ok(GameEvent::GameState(state))) => !state.status.is_ongoing(),
        Some(Ok(GameEvent::GameFull(full))) => !full.state.status.is_ongoing(),
        _ => false,
    }
}

/// Time limits for our move.
///
/// `budget = remaining - overhead`. `stop` is sent once our clock would drop
/// below the move-now threshold, and the engine is killed at the budget, so a
/// forced resignation still reaches the server before our flag falls.
pub fn search_limits(
    state: &GameState,
    color: Color,
    has_clock: bool,
    timing: &TimingConfig,
    grace: Duration,
) -> SearchLimits {
    if !has_clock {
        return SearchLimits::new(timing.unlimited_move_time(), grace);
    }

    let remaining = state.time_of(color);
    let budget = remaining.saturating_sub(timing.move_overhead());

    let mut clock = EngineClock {
        wtime: Duration::from_millis(state.wtime),
        btime: Duration::from_millis(state.btime),
        winc: Duration::from_millis(state.winc),
        binc: Duration::from_millis(state.binc),
    };
    match color {
        Color::White => clock.wtime = budget,
        Color::Black => clock.btime = budget,
    }

    SearchLimits::new(budget, grace)
        .with_clock(clock)
        .with_hard_cap(budget)
        .with_move_now_after(remaining.saturating_sub(timing.move_now_threshold()))
}
