//! Shared fixtures: scripted remote service and in-memory UCI engines.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use botli::{
    Account, BotError, Challenge, ChallengeId, ChallengeOutcome, ChallengeRequest, DeclineReason, EngineBridge,
    EngineLauncher, Event, EventStream, GameEvent, GameId, GameStart, GameStream, PerfStats, RemoteService,
};
use futures::StreamExt;
use futures::stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

pub const ME: &str = "botli";

/// A call the bot made against the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StreamEvents,
    Upgrade,
    Accept(ChallengeId),
    Decline(ChallengeId, DeclineReason),
    Create(ChallengeRequest),
    Cancel(ChallengeId),
    StreamGame(GameId),
    Move(GameId, String),
    Resign(GameId),
    Abort(GameId),
    Claim(GameId),
    Join(String),
    Withdraw(String),
    OnlineBots,
}

type EventSender = mpsc::UnboundedSender<Result<Event, BotError>>;
type GameSender = mpsc::UnboundedSender<Result<GameEvent, BotError>>;

enum Connection<T> {
    Open(mpsc::UnboundedReceiver<Result<T, BotError>>),
    Refuse(BotError),
}

/// Scripted in-memory server.
pub struct FakeService {
    account: Mutex<Account>,
    calls: Mutex<Vec<Call>>,
    event_connections: Mutex<VecDeque<Connection<Event>>>,
    game_connections: Mutex<HashMap<GameId, VecDeque<Connection<GameEvent>>>>,
    outcomes: Mutex<VecDeque<Result<ChallengeOutcome, BotError>>>,
    online: Mutex<Vec<Account>>,
    move_failures: Mutex<VecDeque<BotError>>,
}

impl FakeService {
    pub fn new() -> Arc<Self> {
        Self::with_account(account(ME, 2000))
    }

    /// Server whose profile endpoint returns `account`.
    pub fn with_account(account: Account) -> Arc<Self> {
        Arc::new(Self {
            account: Mutex::new(account),
            calls: Mutex::new(Vec::new()),
            event_connections: Mutex::new(VecDeque::new()),
            game_connections: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(VecDeque::new()),
            online: Mutex::new(Vec::new()),
            move_failures: Mutex::new(VecDeque::new()),
        })
    }

    /// Next event-stream connection succeeds; events are fed through the sender.
    pub fn event_connection(&self) -> EventSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_connections.lock().unwrap().push_back(Connection::Open(rx));
        tx
    }

    /// Next event-stream connection fails with `err`.
    pub fn refuse_events(&self, err: BotError) {
        self.event_connections.lock().unwrap().push_back(Connection::Refuse(err));
    }

    /// Next stream of game `id` succeeds; updates are fed through the sender.
    pub fn game_connection(&self, id: &str) -> GameSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.game_connections
            .lock()
            .unwrap()
            .entry(GameId::new(id))
            .or_default()
            .push_back(Connection::Open(rx));
        tx
    }

    /// Answers the next `create_challenge`.
    pub fn challenge_outcome(&self, outcome: Result<ChallengeOutcome, BotError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Fails the next `make_move`.
    pub fn fail_next_move(&self, err: BotError) {
        self.move_failures.lock().unwrap().push_back(err);
    }

    /// Sets the bots returned by `online_bots`.
    pub fn set_online(&self, bots: Vec<Account>) {
        *self.online.lock().unwrap() = bots;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }

    /// Waits (in virtual time) until a call matching `matches` was made.
    pub async fn wait_for(&self, what: &str, matches: impl Fn(&Call) -> bool) {
        let found = tokio::time::timeout(Duration::from_secs(600), async {
            while self.count(&matches) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(found.is_ok(), "Timed out waiting for {}; calls: {:?}", what, self.calls());
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

fn into_stream<T: Send + 'static>(
    connection: Option<Connection<T>>,
) -> Result<futures::stream::BoxStream<'static, Result<T, BotError>>, BotError> {
    match connection {
        Some(Connection::Open(rx)) => Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()),
        Some(Connection::Refuse(err)) => Err(err),
        None => Ok(stream::pending().boxed()),
    }
}

#[async_trait::async_trait]
impl RemoteService for FakeService {
    async fn stream_events(&self) -> Result<EventStream, BotError> {
        self.record(Call::StreamEvents);
        let next = self.event_connections.lock().unwrap().pop_front();
        into_stream(next)
    }

    async fn get_account(&self) -> Result<Account, BotError> {
        Ok(self.account.lock().unwrap().clone())
    }

    async fn upgrade_to_bot(&self) -> Result<(), BotError> {
        self.record(Call::Upgrade);
        self.account.lock().unwrap().title = Some("BOT".to_string());
        Ok(())
    }

    async fn accept_challenge(&self, id: &ChallengeId) -> Result<(), BotError> {
        self.record(Call::Accept(id.clone()));
        Ok(())
    }

    async fn decline_challenge(&self, id: &ChallengeId, reason: DeclineReason) -> Result<(), BotError> {
        self.record(Call::Decline(id.clone(), reason));
        Ok(())
    }

    async fn create_challenge(&self, request: &ChallengeRequest) -> Result<ChallengeOutcome, BotError> {
        self.record(Call::Create(request.clone()));
        let outcome = self.outcomes.lock().unwrap().pop_front();
        outcome.unwrap_or_else(|| Ok(ChallengeOutcome::Expired(ChallengeId::new("unscripted"))))
    }

    async fn cancel_challenge(&self, id: &ChallengeId) -> Result<(), BotError> {
        self.record(Call::Cancel(id.clone()));
        Ok(())
    }

    async fn stream_game_state(&self, id: &GameId) -> Result<GameStream, BotError> {
        self.record(Call::StreamGame(id.clone()));
        let next = self
            .game_connections
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front);
        into_stream(next)
    }

    async fn make_move(&self, id: &GameId, uci: &str, _offer_draw: bool) -> Result<(), BotError> {
        self.record(Call::Move(id.clone(), uci.to_string()));
        match self.move_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn resign(&self, id: &GameId) -> Result<(), BotError> {
        self.record(Call::Resign(id.clone()));
        Ok(())
    }

    async fn abort(&self, id: &GameId) -> Result<(), BotError> {
        self.record(Call::Abort(id.clone()));
        Ok(())
    }

    async fn claim_victory(&self, id: &GameId) -> Result<(), BotError> {
        self.record(Call::Claim(id.clone()));
        Ok(())
    }

    async fn join_tournament(&self, id: &str, _team: Option<&str>, _password: Option<&str>) -> Result<(), BotError> {
        self.record(Call::Join(id.to_string()));
        Ok(())
    }

    async fn withdraw_tournament(&self, id: &str) -> Result<(), BotError> {
        self.record(Call::Withdraw(id.to_string()));
        Ok(())
    }

    async fn online_bots(&self, _limit: usize) -> Result<Vec<Account>, BotError> {
        self.record(Call::OnlineBots);
        Ok(self.online.lock().unwrap().clone())
    }
}

/// How a fake engine behaves.
#[derive(Debug, Clone)]
pub struct EngineScript {
    /// Moves answered in turn; the last one repeats.
    pub moves: Vec<String>,
    /// Time spent on each search.
    pub think: Duration,
    /// Whether `stop` makes the engine answer at once.
    pub obeys_stop: bool,
}

impl Default for EngineScript {
    fn default() -> Self {
        Self {
            moves: vec!["e2e4".to_string()],
            think: Duration::from_millis(100),
            obeys_stop: true,
        }
    }
}

/// Starts a fake engine and returns a connected, handshaken bridge plus the engine's input log.
pub async fn fake_engine(script: EngineScript) -> (EngineBridge, Arc<Mutex<Vec<String>>>) {
    let (mut bridge, log) = fake_engine_unstarted(script);
    bridge
        .handshake(&BTreeMap::new())
        .await
        .expect("Fake engine handshake");
    (bridge, log)
}

/// Like [`fake_engine`], without the handshake.
pub fn fake_engine_unstarted(script: EngineScript) -> (EngineBridge, Arc<Mutex<Vec<String>>>) {
    let (bot_side, engine_side) = tokio::io::duplex(64 * 1024);
    let (bot_read, bot_write) = tokio::io::split(bot_side);
    let log = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(run_engine(engine_side, script, log.clone()));
    (EngineBridge::from_io(bot_read, bot_write), log)
}

async fn run_engine(io: tokio::io::DuplexStream, script: EngineScript, log: Arc<Mutex<Vec<String>>>) {
    let (read, mut write) = tokio::io::split(io);
    let mut lines = BufReader::new(read).lines();
    let mut searches = 0usize;
    let mut answer_at: Option<tokio::time::Instant> = None;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => return,
            },
            _ = tokio::time::sleep_until(answer_at.unwrap_or_else(tokio::time::Instant::now)), if answer_at.is_some() => {
                answer_at = None;
                let best = script.moves.get(searches).or(script.moves.last()).cloned().unwrap_or_else(|| "(none)".into());
                searches += 1;
                if write.write_all(format!("bestmove {}\n", best).as_bytes()).await.is_err() {
                    return;
                }
                continue;
            }
        };

        log.lock().unwrap().push(line.clone());
        let reply = match line.split_whitespace().next() {
            Some("uci") => Some("id name FakeEngine\noption name Hash type spin default 16 min 1 max 1024\nuciok".to_string()),
            Some("isready") => Some("readyok".to_string()),
            Some("go") => {
                answer_at = Some(tokio::time::Instant::now() + script.think);
                Some("info depth 1 score cp 20".to_string())
            }
            Some("stop") if script.obeys_stop && answer_at.is_some() => {
                answer_at = Some(tokio::time::Instant::now());
                None
            }
            Some("quit") => return,
            _ => None,
        };
        if let Some(reply) = reply {
            if write.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Launcher producing fake engines.
pub struct FakeLauncher {
    script: EngineScript,
    fail: bool,
    launched: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(script: EngineScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            fail: false,
            launched: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            script: EngineScript::default(),
            fail: true,
            launched: AtomicUsize::new(0),
        })
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl EngineLauncher for FakeLauncher {
    async fn launch(&self) -> Result<EngineBridge, BotError> {
        self.launched.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BotError::exhausted("Engine binary missing"));
        }
        let (bridge, _log) = fake_engine(self.script.clone()).await;
        Ok(bridge)
    }
}

pub fn account(id: &str, blitz: i32) -> Account {
    Account {
        id: id.to_string(),
        username: id.to_string(),
        title: Some("BOT".to_string()),
        perfs: [(
            "blitz".to_string(),
            PerfStats {
                rating: blitz,
                games: 100,
                prov: false,
            },
        )]
        .into(),
        disabled: false,
        tos_violation: false,
    }
}

/// `gameFull` for a blitz game between us and `opponent`.
pub fn game_full(id: &str, we_play_white: bool, moves: &str, wtime: u64, btime: u64) -> GameEvent {
    let (white, black) = if we_play_white { (ME, "opponent") } else { ("opponent", ME) };
    serde_json::from_value(serde_json::json!({
        "type": "gameFull",
        "id": id,
        "variant": {"key": "standard"},
        "clock": {"initial": 180000, "increment": 2000},
        "speed": "blitz",
        "rated": true,
        "white": {"id": white, "name": white},
        "black": {"id": black, "name": black},
        "initialFen": "startpos",
        "state": {
            "type": "gameState",
            "moves": moves,
            "wtime": wtime,
            "btime": btime,
            "winc": 2000,
            "binc": 2000,
            "status": "started"
        }
    }))
    .expect("valid gameFull")
}

/// `gameState` update.
pub fn game_state(moves: &str, status: &str, winner: Option<&str>) -> GameEvent {
    let mut state = serde_json::json!({
        "type": "gameState",
        "moves": moves,
        "wtime": 170000,
        "btime": 170000,
        "winc": 2000,
        "binc": 2000,
        "status": status
    });
    if let Some(winner) = winner {
        state["winner"] = serde_json::json!(winner);
    }
    serde_json::from_value(state).expect("valid gameState")
}

pub fn game_start(id: &str) -> GameStart {
    serde_json::from_value(serde_json::json!({
        "gameId": id,
        "color": "white",
        "opponent": {"id": "opponent", "username": "Opponent", "rating": 1900},
        "variant": {"key": "standard"},
        "speed": "blitz",
        "rated": true
    }))
    .expect("valid gameStart")
}

pub fn challenge(id: &str, from: &str, limit: u64, increment: u64) -> Challenge {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "challenger": {"id": from.to_lowercase(), "name": from, "rating": 1800, "title": "BOT"},
        "destUser": {"id": ME, "name": ME},
        "variant": {"key": "standard"},
        "rated": true,
        "speed": "blitz",
        "timeControl": {"type": "clock", "limit": limit, "increment": increment},
        "color": "random"
    }))
    .expect("valid challenge")
}
