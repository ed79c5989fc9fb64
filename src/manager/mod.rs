//! Game manager actor.
//!
//! The manager exclusively owns the active-session set, the queue of game
//! starts beyond the ceiling, the incoming and outgoing challenge queues and
//! the matchmaking state. Everything else talks to it through a
//! [`ManagerHandle`]; spawned work reports back through an internal channel.

mod matchmaking;
mod queue;

pub use matchmaking::Matchmaking;
pub use queue::{ChallengeOrigin, ChallengeQueue, QueuedChallenge, RetryVerdict};

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::{
    Account, BotConfig, BotError, Challenge, ChallengeId, ChallengeOutcome, ChallengeRequest, DeclineReason,
    EngineLauncher, GameId, GameSession, GameStart, MatchmakingType, Opponent, OverflowPolicy, PerfType,
    RemoteService, SessionContext, SessionReport, SessionState, ShutdownMode,
};

/// Finished-session reports kept for status queries.
const COMPLETED_HISTORY: usize = 50;

/// Requests accepted by the manager.
#[derive(Debug)]
pub enum ManagerCommand {
    /// The server started a game.
    GameStarted(GameStart),
    /// The server finished a game.
    GameFinished(GameId),
    /// A challenge passed validation.
    IncomingChallenge(Challenge),
    /// A challenge was withdrawn by its sender.
    ChallengeCanceled(ChallengeId),
    /// Join a tournament.
    JoinTournament {
        /// Tournament id.
        id: String,
        /// Team to play for.
        team: Option<String>,
        /// Entry password.
        password: Option<String>,
    },
    /// Leave a tournament.
    LeaveTournament(String),
    /// Start matchmaking, optionally limited to one perf type.
    RequestMatchmaking(Option<PerfType>),
    /// Stop matchmaking.
    StopMatchmaking,
    /// Clear matchmaking state of a perf type.
    ResetMatchmaking(PerfType),
    /// Append outgoing challenges.
    Enqueue(Vec<ChallengeRequest>),
    /// Drop every waiting outgoing challenge.
    ClearQueue,
    /// Never pick `user` in matchmaking.
    Blacklist(String),
    /// Report current state.
    Status(oneshot::Sender<ManagerStatus>),
    /// Shut down gracefully; answered once every session ended.
    Shutdown(oneshot::Sender<()>),
}

/// Snapshot of the manager's state.
#[derive(Debug, Clone, Default)]
pub struct ManagerStatus {
    /// Running sessions and their states.
    pub active: Vec<(GameId, SessionState)>,
    /// Game starts waiting for a free slot.
    pub pending_games: Vec<GameId>,
    /// Validated incoming challenges not yet accepted.
    pub incoming: usize,
    /// Slots held for accepted challenges.
    pub reserved: usize,
    /// Waiting outgoing challenges.
    pub queued: usize,
    /// Whether an outgoing challenge awaits its answer.
    pub challenge_in_flight: bool,
    /// Open challenges created and not yet taken.
    pub open_challenges: Vec<ChallengeId>,
    /// Whether matchmaking runs.
    pub matchmaking: bool,
    /// Joined tournaments.
    pub tournaments: Vec<String>,
    /// Recently finished sessions, oldest first.
    pub completed: Vec<SessionReport>,
    /// Whether a shutdown is in progress.
    pub shutting_down: bool,
}

/// Cloneable entry point to the manager.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<ManagerCommand>,
}

impl ManagerHandle {
    async fn send(&self, command: ManagerCommand) -> Result<(), BotError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| BotError::invariant("Game manager has stopped"))
    }

    /// Reports a game start.
    pub async fn game_started(&self, game: GameStart) -> Result<(), BotError> {
        self.send(ManagerCommand::GameStarted(game)).await
    }

    /// Reports a game end.
    pub async fn game_finished(&self, id: GameId) -> Result<(), BotError> {
        self.send(ManagerCommand::GameFinished(id)).await
    }

    /// Hands over a validated challenge.
    pub async fn incoming_challenge(&self, challenge: Challenge) -> Result<(), BotError> {
        self.send(ManagerCommand::IncomingChallenge(challenge)).await
    }

    /// Reports a withdrawn challenge.
    pub async fn challenge_canceled(&self, id: ChallengeId) -> Result<(), BotError> {
        self.send(ManagerCommand::ChallengeCanceled(id)).await
    }

    /// Joins a tournament.
    pub async fn request_tournament_joining(
        &self,
        id: impl Into<String>,
        team: Option<String>,
        password: Option<String>,
    ) -> Result<(), BotError> {
        self.send(ManagerCommand::JoinTournament {
            id: id.into(),
            team,
            password,
        })
        .await
    }

    /// Leaves a tournament.
    pub async fn leave_tournament(&self, id: impl Into<String>) -> Result<(), BotError> {
        self.send(ManagerCommand::LeaveTournament(id.into())).await
    }

    /// Starts matchmaking over all configured types, or those of `perf_type`.
    pub async fn request_matchmaking(&self, perf_type: Option<PerfType>) -> Result<(), BotError> {
        self.send(ManagerCommand::RequestMatchmaking(perf_type)).await
    }

    /// Stops matchmaking.
    pub async fn stop_matchmaking(&self) -> Result<(), BotError> {
        self.send(ManagerCommand::StopMatchmaking).await
    }

    /// Clears the search radius and recent opponents of `perf_type`.
    pub async fn reset_matchmaking(&self, perf_type: PerfType) -> Result<(), BotError> {
        self.send(ManagerCommand::ResetMatchmaking(perf_type)).await
    }

    /// Appends outgoing challenges.
    pub async fn enqueue(&self, requests: Vec<ChallengeRequest>) -> Result<(), BotError> {
        self.send(ManagerCommand::Enqueue(requests)).await
    }

    /// Drops every waiting outgoing challenge.
    pub async fn clear_queue(&self) -> Result<(), BotError> {
        self.send(ManagerCommand::ClearQueue).await
    }

    /// Excludes `user` from matchmaking.
    pub async fn blacklist(&self, user: impl Into<String>) -> Result<(), BotError> {
        self.send(ManagerCommand::Blacklist(user.into())).await
    }

    /// Current state.
    pub async fn status(&self) -> Result<ManagerStatus, BotError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::Status(reply)).await?;
        rx.await
            .map_err(|_| BotError::invariant("Game manager dropped a status request"))
    }

    /// Shuts down and waits until every session ended.
    pub async fn shutdown(&self) -> Result<(), BotError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::Shutdown(reply)).await?;
        rx.await
            .map_err(|_| BotError::invariant("Game manager stopped during shutdown"))
    }
}

/// Completion reports of spawned work.
enum Internal {
    SessionDone {
        id: GameId,
        result: Result<SessionReport, JoinError>,
    },
    AcceptDone {
        id: ChallengeId,
        result: Result<(), BotError>,
    },
    ChallengeDone {
        entry: QueuedChallenge,
        result: Result<ChallengeOutcome, BotError>,
    },
    PoolFetched {
        kind: MatchmakingType,
        result: Result<Vec<Account>, BotError>,
    },
    TournamentJoined {
        id: String,
        result: Result<(), BotError>,
    },
}

struct ActiveGame {
    state: watch::Receiver<SessionState>,
    opponent: String,
    perf: PerfType,
}

struct ShutdownProgress {
    replies: Vec<oneshot::Sender<()>>,
    resign_at: Instant,
    resigned: bool,
}

/// Supervisor of all game sessions.
pub struct GameManager {
    config: BotConfig,
    account: Account,
    api: Arc<dyn RemoteService>,
    ctx: SessionContext,
    commands: mpsc::Receiver<ManagerCommand>,
    commands_open: bool,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    shutdown_tx: watch::Sender<ShutdownMode>,
    active: HashMap<GameId, ActiveGame>,
    pending_games: VecDeque<GameStart>,
    incoming: VecDeque<Challenge>,
    reserved: HashMap<GameId, Instant>,
    queue: ChallengeQueue,
    challenge_in_flight: bool,
    open_challenges: BTreeSet<ChallengeId>,
    pool_in_flight: bool,
    matchmaking: Matchmaking,
    blacklist: HashSet<String>,
    tournaments: BTreeSet<String>,
    completed: VecDeque<SessionReport>,
    shutdown: Option<ShutdownProgress>,
}

impl GameManager {
    /// Creates the manager and its handle.
    #[instrument(skip_all, fields(username = %account.username))]
    pub fn new(
        config: BotConfig,
        account: Account,
        api: Arc<dyn RemoteService>,
        launcher: Arc<dyn EngineLauncher>,
    ) -> (Self, ManagerHandle) {
        let (tx, commands) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(ShutdownMode::Running);

        let ctx = SessionContext::new(
            api.clone(),
            launcher,
            account.id.to_lowercase(),
            *config.timing(),
            config.engine().grace(),
            config.stream().game_backoff,
        );

        let manager = Self {
            queue: ChallengeQueue::new(*config.outgoing()),
            matchmaking: Matchmaking::new(config.matchmaking().clone()),
            blacklist: config.challenge().blacklist.iter().map(|u| u.to_lowercase()).collect(),
            config,
            account,
            api,
            ctx,
            commands,
            commands_open: true,
            internal_tx,
            internal_rx,
            shutdown_tx,
            active: HashMap::new(),
            pending_games: VecDeque::new(),
            incoming: VecDeque::new(),
            reserved: HashMap::new(),
            challenge_in_flight: false,
            open_challenges: BTreeSet::new(),
            pool_in_flight: false,
            tournaments: BTreeSet::new(),
            completed: VecDeque::new(),
            shutdown: None,
        };
        (manager, ManagerHandle { tx })
    }

    /// Supervises sessions until shutdown completes.
    #[instrument(skip(self), fields(max_games = self.config.max_games()))]
    pub async fn run(mut self) {
        info!("Game manager started");
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wakeup = self.challenge_wakeup();
            tokio::select! {
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All manager handles dropped");
                        self.commands_open = false;
                        self.begin_shutdown(None);
                    }
                },
                Some(message) = self.internal_rx.recv() => self.handle_internal(message),
                _ = tick.tick() => self.on_tick(),
                _ = tokio::time::sleep(wakeup.unwrap_or_default()), if wakeup.is_some() => {}
            }

            self.pump();

            if self.shutdown.is_some() && self.active.is_empty() {
                self.finish_shutdown().await;
                break;
            }
        }
        info!("Game manager stopped");
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::GameStarted(game) => self.on_game_started(game),
            ManagerCommand::GameFinished(id) => {
                let before = self.pending_games.len();
                self.pending_games.retain(|game| game.game_id != id);
                if self.pending_games.len() != before {
                    info!(game_id = %id, "Queued game finished before it could start");
                } else {
                    debug!(game_id = %id, "Game finished");
                }
            }
            ManagerCommand::IncomingChallenge(challenge) => self.on_incoming(challenge),
            ManagerCommand::ChallengeCanceled(id) => {
                self.incoming.retain(|challenge| challenge.id != id);
                if self.reserved.remove(&id.game_id()).is_some() {
                    debug!(challenge_id = %id, "Released slot of canceled challenge");
                }
            }
            ManagerCommand::JoinTournament { id, team, password } => {
                if self.shutdown.is_some() {
                    warn!(tournament = %id, "Not joining during shutdown");
                    return;
                }
                let api = self.api.clone();
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = api.join_tournament(&id, team.as_deref(), password.as_deref()).await;
                    let _ = internal.send(Internal::TournamentJoined { id, result });
                });
            }
            ManagerCommand::LeaveTournament(id) => {
                self.tournaments.remove(&id);
                let api = self.api.clone();
                let target = id.clone();
                self.best_effort("withdraw", id, async move { api.withdraw_tournament(&target).await });
            }
            ManagerCommand::RequestMatchmaking(perf) => {
                if self.shutdown.is_none() {
                    self.matchmaking.enable(perf);
                }
            }
            ManagerCommand::StopMatchmaking => self.matchmaking.disable(),
            ManagerCommand::ResetMatchmaking(perf) => self.matchmaking.reset(perf),
            ManagerCommand::Enqueue(requests) => {
                if self.shutdown.is_some() {
                    warn!(count = requests.len(), "Not queueing challenges during shutdown");
                    return;
                }
                for request in requests {
                    self.queue.push(QueuedChallenge::new(request, ChallengeOrigin::User));
                }
            }
            ManagerCommand::ClearQueue => {
                let dropped = self.queue.clear();
                info!(dropped, "Challenge queue cleared");
            }
            ManagerCommand::Blacklist(user) => {
                self.blacklist.insert(user.to_lowercase());
            }
            ManagerCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            ManagerCommand::Shutdown(reply) => self.begin_shutdown(Some(reply)),
        }
    }

    #[instrument(skip(self, game), fields(game_id = %game.game_id))]
    fn on_game_started(&mut self, game: GameStart) {
        let id = game.game_id.clone();
        if self.open_challenges.remove(&ChallengeId::new(id.as_str())) {
            debug!("Open challenge taken");
        }
        let known = self.active.contains_key(&id)
            || self.pending_games.iter().any(|g| g.game_id == id)
            || self.completed.iter().any(|report| report.game_id == id);
        if known {
            debug!("Duplicate game start ignored");
            return;
        }
        self.reserved.remove(&id);

        if self.shutdown.is_some() {
            warn!("Game started during shutdown, aborting");
            self.abort_game(id);
            return;
        }

        if self.active.len() < *self.config.max_games() {
            self.spawn_session(game);
            return;
        }

        match self.config.overflow_policy() {
            OverflowPolicy::Queue => {
                info!(queued = self.pending_games.len() + 1, "Concurrency ceiling reached, game queued");
                self.pending_games.push_back(game);
            }
            OverflowPolicy::Abort => {
                warn!("Concurrency ceiling reached, aborting game");
                self.abort_game(id);
            }
        }
    }

    fn on_incoming(&mut self, challenge: Challenge) {
        if self.shutdown.is_some() {
            self.decline(challenge.id, DeclineReason::Later);
            return;
        }
        if self.incoming.iter().any(|c| c.id == challenge.id) || self.reserved.contains_key(&challenge.id.game_id()) {
            debug!(challenge_id = %challenge.id, "Challenge already known");
            return;
        }
        debug!(challenge_id = %challenge.id, waiting = self.incoming.len() + 1, "Challenge waiting for a slot");
        self.incoming.push_back(challenge);
    }

    fn spawn_session(&mut self, game: GameStart) {
        let id = game.game_id.clone();
        let session = GameSession::new(id.clone(), self.ctx.clone(), self.shutdown_tx.subscribe());
        let state = session.subscribe();

        let handle = tokio::spawn(session.run());
        let internal = self.internal_tx.clone();
        let done_id = id.clone();
        tokio::spawn(async move {
            let result = handle.await;
            let _ = internal.send(Internal::SessionDone { id: done_id, result });
        });

        let opponent = game
            .opponent
            .id
            .clone()
            .unwrap_or_else(|| game.opponent.username.to_lowercase());
        info!(
            game_id = %id,
            opponent = %game.opponent.username,
            active = self.active.len() + 1,
            "Session spawned"
        );
        self.active.insert(
            id,
            ActiveGame {
                state,
                opponent,
                perf: PerfType::new(game.variant.key, game.speed),
            },
        );
    }

    fn handle_internal(&mut self, message: Internal) {
        let now = Instant::now();
        match message {
            Internal::SessionDone { id, result } => self.on_session_done(id, result, now),
            Internal::AcceptDone { id, result } => {
                if let Err(err) = result {
                    warn!(challenge_id = %id, error = %err, "Failed to accept challenge");
                    self.reserved.remove(&id.game_id());
                }
            }
            Internal::ChallengeDone { entry, result } => self.on_challenge_done(entry, result, now),
            Internal::PoolFetched { kind, result } => {
                self.pool_in_flight = false;
                match result {
                    Ok(pool) => {
                        let blacklist = &self.blacklist;
                        if let Some(request) = self.matchmaking.select(
                            &kind,
                            &pool,
                            &self.account,
                            |user| blacklist.contains(&user.to_lowercase()),
                            now,
                        ) {
                            self.queue.push(QueuedChallenge::new(request, ChallengeOrigin::Matchmaking));
                        }
                    }
                    Err(err) => warn!(error = %err, "Failed to fetch online bots"),
                }
            }
            Internal::TournamentJoined { id, result } => match result {
                Ok(()) => {
                    info!(tournament = %id, "Joined tournament");
                    self.tournaments.insert(id);
                }
                Err(err) => warn!(tournament = %id, error = %err, "Failed to join tournament"),
            },
        }
    }

    #[instrument(skip(self, result, now), fields(game_id = %id))]
    fn on_session_done(&mut self, id: GameId, result: Result<SessionReport, JoinError>, now: Instant) {
        let Some(game) = self.active.remove(&id) else {
            error!("Finished session was not active");
            return;
        };

        match result {
            Ok(report) => {
                match report.state {
                    SessionState::Failed => warn!(
                        error = ?report.error.as_ref().map(ToString::to_string),
                        plies = report.plies,
                        "Session failed"
                    ),
                    state => info!(state = %state, status = ?report.status, winner = ?report.winner, "Session ended"),
                }
                self.completed.push_back(report);
                if self.completed.len() > COMPLETED_HISTORY {
                    self.completed.pop_front();
                }
            }
            Err(err) => {
                let last_state = *game.state.borrow();
                error!(error = %err, last_state = %last_state, "Session task crashed");
                let api = self.api.clone();
                let target = id.clone();
                self.best_effort("abort/resign", id.to_string(), async move {
                    match api.abort(&target).await {
                        Ok(()) => Ok(()),
                        Err(_) => api.resign(&target).await,
                    }
                });
            }
        }

        self.matchmaking.record(game.perf, &game.opponent, now);
        self.matchmaking.trigger();
        debug!(active = self.active.len(), "Slot freed");
    }

    #[instrument(skip(self, entry, result, now), fields(opponent = %entry.request.opponent))]
    fn on_challenge_done(&mut self, entry: QueuedChallenge, result: Result<ChallengeOutcome, BotError>, now: Instant) {
        self.challenge_in_flight = false;
        let perf = entry.request.perf_type();
        let opponent = match &entry.request.opponent {
            Opponent::User(name) => Some(name.to_lowercase()),
            Opponent::Open => None,
        };

        match result {
            Ok(ChallengeOutcome::Accepted(id)) => {
                info!(challenge_id = %id, "Challenge accepted");
                let game_id = id.game_id();
                if !self.active.contains_key(&game_id) {
                    self.reserved
                        .insert(game_id, now + self.config.challenge().accept_timeout());
                }
            }
            Ok(ChallengeOutcome::Created(id)) => {
                info!(challenge_id = %id, "Open challenge created");
                if self.shutdown.is_some() {
                    self.cancel_challenge(id);
                } else {
                    self.open_challenges.insert(id);
                }
            }
            Ok(ChallengeOutcome::Declined { id, reason }) => {
                info!(challenge_id = %id, reason = ?reason, "Challenge declined");
                if let Some(opponent) = opponent {
                    self.matchmaking.record(perf, &opponent, now);
                }
            }
            Ok(ChallengeOutcome::Expired(id)) => {
                info!(challenge_id = %id, "Challenge expired");
                if let Some(opponent) = opponent {
                    self.matchmaking.record(perf, &opponent, now);
                }
            }
            Ok(ChallengeOutcome::RateLimited) => {
                warn!("Challenge rate limited");
                self.retry(entry, now);
            }
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "Challenge failed");
                self.retry(entry, now);
            }
            Err(err) => warn!(error = %err, "Challenge dropped"),
        }
    }

    fn retry(&mut self, entry: QueuedChallenge, now: Instant) {
        if self.shutdown.is_some() {
            return;
        }
        if let RetryVerdict::GaveUp = self.queue.retry(entry, now) {
            debug!(queued = self.queue.len(), "Challenge removed from queue");
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        self.reserved.retain(|id, until| {
            let keep = now < *until;
            if !keep {
                warn!(game_id = %id, "Accepted challenge never started, slot released");
            }
            keep
        });

        if let Some(progress) = self.shutdown.as_mut() {
            if !progress.resigned && now >= progress.resign_at {
                warn!(active = self.active.len(), "Shutdown grace elapsed, resigning remaining games");
                progress.resigned = true;
                self.shutdown_tx.send_replace(ShutdownMode::Resign);
            }
        }
    }

    /// Starts whatever the free capacity allows.
    fn pump(&mut self) {
        let now = Instant::now();
        let max_games = *self.config.max_games();

        while self.active.len() < max_games {
            let Some(game) = self.pending_games.pop_front() else {
                break;
            };
            self.spawn_session(game);
        }

        if self.shutdown.is_some() {
            return;
        }

        while self.free_slots() > 0 {
            let Some(challenge) = self.incoming.pop_front() else {
                break;
            };
            self.accept(challenge, now);
        }

        if !self.challenge_in_flight && self.free_slots() > 0 {
            if let Some(entry) = self.queue.pop_ready(now) {
                self.send_challenge(entry);
            }
        }

        if self.is_idle() && !self.pool_in_flight && self.matchmaking.should_cycle(now) {
            if let Some(kind) = self.matchmaking.begin_cycle(now) {
                self.fetch_pool(kind);
            }
        }
    }

    /// Time until a waiting challenge leaves its cool-down, when one could be sent then.
    fn challenge_wakeup(&self) -> Option<Duration> {
        if self.shutdown.is_some() || self.challenge_in_flight || self.free_slots() == 0 {
            return None;
        }
        self.queue
            .next_wakeup(Instant::now())
            .filter(|wait| !wait.is_zero())
    }

    fn free_slots(&self) -> usize {
        let used = self.active.len() + self.pending_games.len() + self.reserved.len() + usize::from(self.challenge_in_flight);
        self.config.max_games().saturating_sub(used)
    }

    fn is_idle(&self) -> bool {
        self.active.is_empty()
            && self.pending_games.is_empty()
            && self.incoming.is_empty()
            && self.reserved.is_empty()
            && self.queue.is_empty()
            && !self.challenge_in_flight
    }

    fn accept(&mut self, challenge: Challenge, now: Instant) {
        let id = challenge.id;
        info!(challenge_id = %id, "Accepting challenge");
        self.reserved
            .insert(id.game_id(), now + self.config.challenge().accept_timeout());

        let api = self.api.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = api.accept_challenge(&id).await;
            let _ = internal.send(Internal::AcceptDone { id, result });
        });
    }

    fn send_challenge(&mut self, entry: QueuedChallenge) {
        info!(
            opponent = %entry.request.opponent,
            tc = %entry.request.time_control,
            origin = %entry.origin,
            attempt = entry.attempts + 1,
            "Sending challenge"
        );
        self.challenge_in_flight = true;

        let api = self.api.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = api.create_challenge(&entry.request).await;
            let _ = internal.send(Internal::ChallengeDone { entry, result });
        });
    }

    fn fetch_pool(&mut self, kind: MatchmakingType) {
        debug!(tc = %kind.time_control, variant = %kind.variant, "Matchmaking cycle");
        self.pool_in_flight = true;

        let api = self.api.clone();
        let internal = self.internal_tx.clone();
        let limit = self.matchmaking.pool_size();
        tokio::spawn(async move {
            let result = api.online_bots(limit).await;
            let _ = internal.send(Internal::PoolFetched { kind, result });
        });
    }

    fn decline(&self, id: ChallengeId, reason: DeclineReason) {
        let api = self.api.clone();
        let target = id.clone();
        self.best_effort("decline", id.to_string(), async move {
            api.decline_challenge(&target, reason).await
        });
    }

    fn cancel_challenge(&self, id: ChallengeId) {
        let api = self.api.clone();
        let target = id.clone();
        self.best_effort("cancel", id.to_string(), async move { api.cancel_challenge(&target).await });
    }

    fn abort_game(&self, id: GameId) {
        let api = self.api.clone();
        let target = id.clone();
        self.best_effort("abort", id.to_string(), async move { api.abort(&target).await });
    }

    fn best_effort<F>(&self, action: &'static str, target: String, call: F)
    where
        F: Future<Output = Result<(), BotError>> + Send + 'static,
    {
        let span = info_span!("best_effort", action, target = %target);
        tokio::spawn(
            async move {
                if let Err(err) = call.await {
                    warn!(error = %err, "Best-effort call failed");
                }
            }
            .instrument(span),
        );
    }

    #[instrument(skip(self, reply))]
    fn begin_shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        if let Some(progress) = self.shutdown.as_mut() {
            progress.replies.extend(reply);
            return;
        }

        info!(active = self.active.len(), "Shutting down");
        self.matchmaking.disable();

        for challenge in std::mem::take(&mut self.incoming) {
            self.decline(challenge.id, DeclineReason::Later);
        }
        for id in std::mem::take(&mut self.open_challenges) {
            self.cancel_challenge(id);
        }
        let dropped = self.queue.clear();
        for game in std::mem::take(&mut self.pending_games) {
            self.abort_game(game.game_id);
        }
        self.reserved.clear();
        debug!(dropped, "Queues drained");

        let grace = self.config.timing().shutdown_grace();
        let resigned = grace.is_zero();
        self.shutdown_tx.send_replace(if resigned {
            ShutdownMode::Resign
        } else {
            ShutdownMode::Finish
        });
        self.shutdown = Some(ShutdownProgress {
            replies: reply.into_iter().collect(),
            resign_at: Instant::now() + grace,
            resigned,
        });
    }

    async fn finish_shutdown(&mut self) {
        for id in std::mem::take(&mut self.tournaments) {
            match self.api.withdraw_tournament(&id).await {
                Ok(()) => info!(tournament = %id, "Withdrew from tournament"),
                Err(err) => warn!(tournament = %id, error = %err, "Failed to withdraw from tournament"),
            }
        }

        if let Some(progress) = self.shutdown.take() {
            for reply in progress.replies {
                let _ = reply.send(());
            }
        }
        info!("Shutdown complete");
    }

    fn status(&self) -> ManagerStatus {
        let mut active: Vec<(GameId, SessionState)> = self
            .active
            .iter()
            .map(|(id, game)| (id.clone(), *game.state.borrow()))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));

        ManagerStatus {
            active,
            pending_games: self.pending_games.iter().map(|g| g.game_id.clone()).collect(),
            incoming: self.incoming.len(),
            reserved: self.reserved.len(),
            queued: self.queue.len(),
            challenge_in_flight: self.challenge_in_flight,
            open_challenges: self.open_challenges.iter().cloned().collect(),
            matchmaking: self.matchmaking.is_enabled(),
            tournaments: self.tournaments.iter().cloned().collect(),
            completed: self.completed.iter().cloned().collect(),
            shutting_down: self.shutdown.is_some(),
        }
    }
}
