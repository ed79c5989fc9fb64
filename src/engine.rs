//! UCI engine bridge.
//!
//! One [`EngineBridge`] owns one engine process and drives it through the
//! line-oriented UCI protocol. The bridge state is explicit: a second `go`
//! while a search is outstanding is a programming error, and a bridge whose
//! engine was killed refuses further commands.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{BotError, EngineConfig, Variant};

type EngineReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
type EngineWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Protocol state of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum BridgeState {
    /// Ready for commands.
    Idle,
    /// A `go` is outstanding.
    AwaitingMove,
    /// The engine is gone; every command fails.
    Terminated,
}

/// Answer to a `go`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineMove {
    /// Best move in UCI notation.
    Move(String),
    /// The position has no legal move.
    NoMove,
}

/// Both clocks as sent with `go`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineClock {
    /// White's remaining time.
    pub wtime: Duration,
    /// Black's remaining time.
    pub btime: Duration,
    /// White's increment.
    pub winc: Duration,
    /// Black's increment.
    pub binc: Duration,
}

/// Time limits of one search, relative to the moment `go` is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchLimits {
    /// Clocks to report; `None` searches for `budget` via `movetime`.
    pub clock: Option<EngineClock>,
    /// Time the search may normally take.
    pub budget: Duration,
    /// When to send `stop`.
    pub move_now_after: Duration,
    /// When to kill the engine.
    pub hard_deadline: Duration,
}

impl SearchLimits {
    /// Fixed-time search: `stop` at the budget, kill after `grace` more.
    pub fn new(budget: Duration, grace: Duration) -> Self {
        Self {
            clock: None,
            budget,
            move_now_after: budget,
            hard_deadline: budget + grace,
        }
    }

    /// Reports clocks to the engine instead of a fixed move time.
    pub fn with_clock(mut self, clock: EngineClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sends `stop` earlier than the budget and the hard deadline.
    pub fn with_move_now_after(mut self, after: Duration) -> Self {
        self.move_now_after = after.min(self.budget).min(self.hard_deadline);
        self
    }

    /// Caps the hard deadline; `stop` never comes after the kill.
    pub fn with_hard_cap(mut self, cap: Duration) -> Self {
        self.hard_deadline = self.hard_deadline.min(cap);
        self.move_now_after = self.move_now_after.min(self.hard_deadline);
        self
    }

    fn command(&self) -> String {
        match &self.clock {
            Some(clock) => format!(
                "go wtime {} btime {} winc {} binc {}",
                ceil_millis(clock.wtime),
                ceil_millis(clock.btime),
                ceil_millis(clock.winc),
                ceil_millis(clock.binc)
            ),
            None => format!("go movetime {}", ceil_millis(self.budget)),
        }
    }
}

/// Whole milliseconds, rounded up.
pub fn ceil_millis(duration: Duration) -> u128 {
    duration.as_nanos().div_ceil(1_000_000)
}

/// One engine process speaking UCI.
pub struct EngineBridge {
    name: String,
    child: Option<Child>,
    lines: Lines<BufReader<EngineReader>>,
    writer: EngineWriter,
    state: BridgeState,
    handshake_timeout: Duration,
    quit_timeout: Duration,
}

impl fmt::Debug for EngineBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBridge")
            .field("name", &self.name)
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .field("state", &self.state)
            .finish()
    }
}

impl EngineBridge {
    /// Spawns the configured engine and performs the handshake.
    #[instrument(skip(config), fields(command = ?config.command()))]
    pub async fn start(config: &EngineConfig) -> Result<Self, BotError> {
        let (program, args) = config
            .command()
            .split_first()
            .ok_or_else(|| BotError::exhausted("Engine command is empty"))?;

        let mut command = Command::new(program);
        command.args(args);
        if let Some(dir) = config.working_dir() {
            command.current_dir(dir);
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BotError::exhausted(format!("Failed to start engine {}: {}", program, e)))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            error!("Failed to capture engine stdin");
            BotError::exhausted("Failed to capture engine stdin")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            error!("Failed to capture engine stdout");
            BotError::exhausted("Failed to capture engine stdout")
        })?;

        info!(pid = ?child.id(), "Engine process started");

        let mut bridge = Self::from_io(stdout, stdin)
            .with_handshake_timeout(config.handshake_timeout())
            .with_quit_timeout(config.quit_timeout());
        bridge.child = Some(child);

        if let Err(err) = bridge.handshake(config.options()).await {
            bridge.kill().await;
            return Err(err);
        }
        Ok(bridge)
    }

    /// Wraps an engine reachable over arbitrary streams. No handshake yet.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
        W: AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let reader: EngineReader = Box::new(reader);
        Self {
            name: "engine".to_string(),
            child: None,
            lines: BufReader::new(reader).lines(),
            writer: Box::new(writer),
            state: BridgeState::Idle,
            handshake_timeout: Duration::from_secs(10),
            quit_timeout: Duration::from_secs(2),
        }
    }

    /// Sets the limit for `uci` and `isready` round trips.
    pub fn with_handshake_timeout(mut self, limit: Duration) -> Self {
        self.handshake_timeout = limit;
        self
    }

    /// Sets the time `quit` waits before killing.
    pub fn with_quit_timeout(mut self, limit: Duration) -> Self {
        self.quit_timeout = limit;
        self
    }

    /// Name the engine reported in `id name`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current protocol state.
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// `uci`, options, `isready`.
    #[instrument(skip(self, options))]
    pub async fn handshake(&mut self, options: &BTreeMap<String, String>) -> Result<(), BotError> {
        self.send("uci").await?;
        self.wait_for("uciok", self.handshake_timeout).await?;

        for (name, value) in options {
            self.set_option(name, value).await?;
        }

        self.ready().await?;
        info!(engine = %self.name, "Engine handshake complete");
        Ok(())
    }

    /// Prepares the engine for a new game of `variant`.
    #[instrument(skip(self))]
    pub async fn new_game(&mut self, variant: Variant) -> Result<(), BotError> {
        if variant == Variant::Chess960 {
            self.set_option("UCI_Chess960", "true").await?;
        }
        if let Some(name) = variant.uci_name() {
            self.set_option("UCI_Variant", name).await?;
        }
        self.send("ucinewgame").await?;
        self.ready().await
    }

    /// Synchronizes the board: initial position plus every move since.
    #[instrument(skip(self, moves), fields(plies = moves.len()))]
    pub async fn set_position(&mut self, initial_fen: &str, moves: &[String]) -> Result<(), BotError> {
        self.expect_idle()?;

        let mut command = if initial_fen == "startpos" {
            "position startpos".to_string()
        } else {
            format!("position fen {}", initial_fen)
        };
        if !moves.is_empty() {
            command.push_str(" moves ");
            command.push_str(&moves.join(" "));
        }
        self.send(&command).await
    }

    /// Searches the current position within `limits`.
    ///
    /// Sends `stop` once `move_now_after` elapses. If no `bestmove` arrives
    /// by `hard_deadline` the engine is killed and the bridge terminates.
    #[instrument(skip(self), fields(budget_ms = limits.budget.as_millis() as u64))]
    pub async fn go(&mut self, limits: &SearchLimits) -> Result<EngineMove, BotError> {
        match self.state {
            BridgeState::AwaitingMove => {
                error!("Second go while a search is outstanding");
                return Err(BotError::invariant("go called while a search is outstanding"));
            }
            BridgeState::Terminated => return Err(BotError::protocol("Engine is terminated")),
            BridgeState::Idle => {}
        }

        let started = Instant::now();
        let move_now_at = started + limits.move_now_after;
        let hard_at = started + limits.hard_deadline;

        self.send(&limits.command()).await?;
        self.state = BridgeState::AwaitingMove;

        let mut stop_sent = false;
        loop {
            let wake_at = if stop_sent { hard_at } else { move_now_at.min(hard_at) };

            match timeout_at(wake_at, self.lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    trace!(line = %line, "Engine output");
                    if let Some(rest) = line.strip_prefix("bestmove") {
                        self.state = BridgeState::Idle;
                        let best = parse_bestmove(rest)?;
                        debug!(best = ?best, elapsed_ms = started.elapsed().as_millis() as u64, "Engine answered");
                        return Ok(best);
                    }
                }
                Ok(Ok(None)) => {
                    self.state = BridgeState::Terminated;
                    return Err(BotError::protocol("Engine closed its output during search"));
                }
                Ok(Err(e)) => {
                    self.state = BridgeState::Terminated;
                    return Err(BotError::protocol(format!("Failed to read engine output: {}", e)));
                }
                Err(_) if !stop_sent && Instant::now() < hard_at => {
                    debug!("Move-now deadline reached, sending stop");
                    self.send("stop").await?;
                    stop_sent = true;
                }
                Err(_) => {
                    warn!(hard_deadline_ms = limits.hard_deadline.as_millis() as u64, "Engine missed hard deadline");
                    self.kill().await;
                    return Err(BotError::engine_timeout(format!(
                        "No bestmove within {} ms",
                        ceil_millis(limits.hard_deadline)
                    )));
                }
            }
        }
    }

    /// Ends an abandoned search: sends `stop` and discards the answer.
    ///
    /// The bridge is idle again afterwards. An engine that does not answer
    /// within the quit timeout is killed.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<(), BotError> {
        if self.state != BridgeState::AwaitingMove {
            return Ok(());
        }
        self.send("stop").await?;

        let deadline = Instant::now() + self.quit_timeout;
        loop {
            match timeout_at(deadline, self.lines.next_line()).await {
                Ok(Ok(Some(line))) if line.starts_with("bestmove") => {
                    debug!(line = %line, "Discarded answer of a stopped search");
                    self.state = BridgeState::Idle;
                    return Ok(());
                }
                Ok(Ok(Some(_))) => {}
                Ok(Ok(None)) | Ok(Err(_)) => {
                    self.state = BridgeState::Terminated;
                    return Err(BotError::protocol("Engine closed its output after stop"));
                }
                Err(_) => {
                    warn!("Engine ignored stop, killing");
                    self.kill().await;
                    return Err(BotError::engine_timeout("No bestmove after stop"));
                }
            }
        }
    }

    /// Orderly shutdown, killing the process if it does not exit in time.
    #[instrument(skip(self), fields(engine = %self.name))]
    pub async fn quit(mut self) {
        if self.state != BridgeState::Terminated && self.send("quit").await.is_err() {
            debug!("Engine gone before quit");
        }
        self.state = BridgeState::Terminated;

        if let Some(child) = self.child.as_mut() {
            let waited = timeout(self.quit_timeout, child.wait()).await;
            match waited {
                Ok(Ok(status)) => debug!(status = %status, "Engine exited"),
                Ok(Err(e)) => warn!(error = %e, "Failed to wait for engine"),
                Err(_) => {
                    warn!("Engine ignored quit, killing");
                    self.kill().await;
                }
            }
        }
    }

    async fn set_option(&mut self, name: &str, value: &str) -> Result<(), BotError> {
        self.send(&format!("setoption name {} value {}", name, value)).await
    }

    async fn ready(&mut self) -> Result<(), BotError> {
        self.send("isready").await?;
        self.wait_for("readyok", self.handshake_timeout).await
    }

    fn expect_idle(&self) -> Result<(), BotError> {
        match self.state {
            BridgeState::Idle => Ok(()),
            BridgeState::AwaitingMove => Err(BotError::invariant("Engine is searching")),
            BridgeState::Terminated => Err(BotError::protocol("Engine is terminated")),
        }
    }

    async fn send(&mut self, command: &str) -> Result<(), BotError> {
        if self.state == BridgeState::Terminated {
            return Err(BotError::protocol("Engine is terminated"));
        }
        trace!(command = %command, "Sending to engine");

        let written = async {
            self.writer.write_all(command.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await
        }
        .await;

        written.map_err(|e| {
            self.state = BridgeState::Terminated;
            BotError::protocol(format!("Failed to write to engine: {}", e))
        })
    }

    /// Reads until a line equal to `token`, collecting `id name` on the way.
    async fn wait_for(&mut self, token: &str, limit: Duration) -> Result<(), BotError> {
        let deadline = Instant::now() + limit;
        loop {
            let line = match timeout_at(deadline, self.lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    self.state = BridgeState::Terminated;
                    return Err(BotError::protocol(format!("Engine closed its output before {}", token)));
                }
                Ok(Err(e)) => {
                    self.state = BridgeState::Terminated;
                    return Err(BotError::protocol(format!("Failed to read engine output: {}", e)));
                }
                Err(_) => {
                    self.kill().await;
                    return Err(BotError::engine_timeout(format!("No {} within {:?}", token, limit)));
                }
            };

            let line = line.trim();
            if line == token {
                return Ok(());
            }
            if let Some(name) = line.strip_prefix("id name ") {
                self.name = name.to_string();
            }
        }
    }

    async fn kill(&mut self) {
        self.state = BridgeState::Terminated;
        self.writer = Box::new(tokio::io::sink());
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill engine");
            }
        }
    }
}

fn parse_bestmove(rest: &str) -> Result<EngineMove, BotError> {
    match rest.split_whitespace().next() {
        Some("(none)") | Some("0000") => Ok(EngineMove::NoMove),
        Some(uci) if is_uci_move(uci) => Ok(EngineMove::Move(uci.to_string())),
        _ => Err(BotError::protocol(format!("Unparseable bestmove:{}", rest))),
    }
}

fn is_uci_move(text: &str) -> bool {
    let bytes = text.as_bytes();
    let square = |file: u8, rank: u8| (b'a'..=b'h').contains(&file) && (b'1'..=b'8').contains(&rank);
    match bytes {
        // Crazyhouse drop, e.g. P@e4.
        [piece, b'@', file, rank] => b"PNBRQ".contains(piece) && square(*file, *rank),
        [f1, r1, f2, r2] => square(*f1, *r1) && square(*f2, *r2),
        [f1, r1, f2, r2, promotion] => square(*f1, *r1) && square(*f2, *r2) && b"qrbnk".contains(promotion),
        _ => false,
    }
}

/// Creates engine bridges for new games.
#[async_trait::async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Starts a ready-to-use engine.
    async fn launch(&self) -> Result<EngineBridge, BotError>;
}

/// Launches the configured engine binary.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: EngineConfig,
}

impl ProcessLauncher {
    /// Creates a launcher for `config`.
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<EngineBridge, BotError> {
        EngineBridge::start(&self.config).await
    }
}
