//! Account event stream consumer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    Backoff, BotError, Challenge, ChallengeDecision, ChallengeRequest, ChallengeValidator, Event, ManagerHandle,
    Opponent, RemoteService, StreamConfig,
};

/// Classification of an account event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum EventKind {
    /// Someone challenged us.
    ChallengeReceived,
    /// A challenge was withdrawn.
    ChallengeCanceled,
    /// A challenge was declined.
    ChallengeDeclined,
    /// A game began.
    GameStarted,
    /// A game ended.
    GameFinished,
    /// Keep-alive.
    Heartbeat,
    /// Anything else.
    Other,
}

/// An event with its kind and dedup key.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Kind.
    pub kind: EventKind,
    /// Game or challenge id, when the event carries one.
    pub key: Option<String>,
    /// Payload.
    pub event: Event,
}

impl From<Event> for EventRecord {
    fn from(event: Event) -> Self {
        let (kind, key) = match &event {
            Event::Challenge { challenge } => (EventKind::ChallengeReceived, Some(challenge.id.to_string())),
            Event::ChallengeCanceled { challenge } => (EventKind::ChallengeCanceled, Some(challenge.id.to_string())),
            Event::ChallengeDeclined { challenge } => (EventKind::ChallengeDeclined, Some(challenge.id.to_string())),
            Event::GameStart { game } => (EventKind::GameStarted, Some(game.game_id.to_string())),
            Event::GameFinish { game } => (EventKind::GameFinished, Some(game.game_id.to_string())),
            Event::Heartbeat => (EventKind::Heartbeat, None),
            Event::Other => (EventKind::Other, None),
        };
        Self { kind, key, event }
    }
}

/// Drops `(key, kind)` pairs seen within a time window.
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    seen: HashMap<(String, EventKind), Instant>,
}

impl DedupWindow {
    /// Creates an empty window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Whether `record` is new; remembers it if so. Keyless events are always new.
    pub fn admit(&mut self, record: &EventRecord, now: Instant) -> bool {
        let Some(key) = &record.key else {
            return true;
        };

        let window = self.window;
        self.seen.retain(|_, at| now.duration_since(*at) < window);

        let entry = (key.clone(), record.kind);
        if self.seen.contains_key(&entry) {
            return false;
        }
        self.seen.insert(entry, now);
        true
    }
}

/// Runtime requests to the event handler.
#[derive(Debug)]
pub enum EventControl {
    /// Decline `user` from now on.
    Blacklist(String),
    /// Accept `user` even when a whitelist is active.
    Whitelist(String),
    /// Challenge back the sender of the last received challenge.
    Rechallenge,
    /// Close the stream and return.
    Stop,
}

/// Cloneable entry point to a running event handler.
#[derive(Debug, Clone)]
pub struct EventHandlerHandle {
    tx: mpsc::UnboundedSender<EventControl>,
}

impl EventHandlerHandle {
    fn send(&self, control: EventControl) -> Result<(), BotError> {
        self.tx
            .send(control)
            .map_err(|_| BotError::invariant("Event handler has stopped"))
    }

    /// Declines `user` from now on.
    pub fn blacklist(&self, user: impl Into<String>) -> Result<(), BotError> {
        self.send(EventControl::Blacklist(user.into()))
    }

    /// Accepts `user` from now on.
    pub fn whitelist(&self, user: impl Into<String>) -> Result<(), BotError> {
        self.send(EventControl::Whitelist(user.into()))
    }

    /// Challenges back the last challenger.
    pub fn rechallenge(&self) -> Result<(), BotError> {
        self.send(EventControl::Rechallenge)
    }

    /// Stops the handler. Succeeds if it already stopped.
    pub fn stop(&self) {
        let _ = self.tx.send(EventControl::Stop);
    }
}

/// Why a stream connection ended.
enum Disconnect {
    Stopped,
    Lost(String),
}

/// Consumes the account event stream for the lifetime of the bot.
pub struct EventHandler {
    api: Arc<dyn RemoteService>,
    manager: ManagerHandle,
    validator: ChallengeValidator,
    config: StreamConfig,
    username: String,
    dedup: DedupWindow,
    control: mpsc::UnboundedReceiver<EventControl>,
    last_challenge: Option<Challenge>,
}

impl EventHandler {
    /// Creates a handler and its control handle.
    pub fn new(
        api: Arc<dyn RemoteService>,
        manager: ManagerHandle,
        validator: ChallengeValidator,
        config: StreamConfig,
        username: &str,
    ) -> (Self, EventHandlerHandle) {
        let (tx, control) = mpsc::unbounded_channel();
        let handler = Self {
            api,
            manager,
            validator,
            dedup: DedupWindow::new(config.dedup_window()),
            config,
            username: username.to_lowercase(),
            control,
            last_challenge: None,
        };
        (handler, EventHandlerHandle { tx })
    }

    /// Reads and dispatches events, reconnecting on failure.
    ///
    /// Returns `Ok` only when stopped; returns the error for fatal-auth
    /// failures and once `max_attempts` consecutive connections failed.
    #[instrument(skip(self), fields(username = %self.username))]
    pub async fn run(mut self) -> Result<(), BotError> {
        let mut backoff = Backoff::new(self.config.backoff);

        loop {
            let reason = match self.consume(&mut backoff).await {
                Ok(Disconnect::Stopped) => {
                    info!("Event handler stopped");
                    return Ok(());
                }
                Ok(Disconnect::Lost(reason)) => reason,
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "Event stream rejected credentials");
                    return Err(err);
                }
                Err(err) => err.to_string(),
            };

            let Some(delay) = backoff.next_delay() else {
                error!(attempts = backoff.attempts(), "Event stream reconnects exhausted");
                return Err(BotError::transient(format!(
                    "Event stream lost {} times in a row, last: {}",
                    backoff.attempts(),
                    reason
                )));
            };
            warn!(reason = %reason, delay_ms = delay.as_millis() as u64, "Event stream lost, reconnecting");

            tokio::select! {
                _ = sleep(delay) => {}
                stopped = self.drain_control_until_stop() => if stopped {
                    info!("Event handler stopped while reconnecting");
                    return Ok(());
                },
            }
        }
    }

    async fn consume(&mut self, backoff: &mut Backoff) -> Result<Disconnect, BotError> {
        let mut stream = self.api.stream_events().await?;
        info!("Connected to event stream");
        let heartbeat = self.config.heartbeat_timeout();

        loop {
            // Controls first: a blacklist sent before an event applies to it.
            tokio::select! {
                biased;
                control = self.control.recv() => match control {
                    Some(EventControl::Stop) | None => return Ok(Disconnect::Stopped),
                    Some(control) => self.apply(control).await,
                },
                next = timeout(heartbeat, stream.next()) => match next {
                    Err(_) => return Ok(Disconnect::Lost(format!("no data for {:?}", heartbeat))),
                    Ok(None) => return Ok(Disconnect::Lost("server closed the stream".to_string())),
                    Ok(Some(Err(err))) => return Err(err),
                    Ok(Some(Ok(event))) => {
                        backoff.reset();
                        if !self.dispatch(event.into()).await {
                            return Ok(Disconnect::Stopped);
                        }
                    }
                },
            }
        }
    }

    /// Applies control messages while waiting; true once told to stop.
    async fn drain_control_until_stop(&mut self) -> bool {
        loop {
            match self.control.recv().await {
                Some(EventControl::Stop) | None => return true,
                Some(control) => self.apply(control).await,
            }
        }
    }

    async fn apply(&mut self, control: EventControl) {
        match control {
            EventControl::Blacklist(user) => {
                info!(user = %user, "Blacklisted");
                self.validator.blacklist(&user);
            }
            EventControl::Whitelist(user) => {
                info!(user = %user, "Whitelisted");
                self.validator.whitelist(&user);
            }
            EventControl::Rechallenge => self.rechallenge().await,
            EventControl::Stop => {}
        }
    }

    async fn rechallenge(&self) {
        let Some(challenge) = &self.last_challenge else {
            warn!("No challenge received yet");
            return;
        };
        let (Some(challenger), Some(time_control)) = (&challenge.challenger, challenge.time_control.clock()) else {
            warn!(challenge_id = %challenge.id, "Last challenge cannot be repeated");
            return;
        };

        let request = ChallengeRequest::new(Opponent::User(challenger.name.clone()), time_control)
            .with_rated(challenge.rated)
            .with_variant(challenge.variant.key);
        info!(opponent = %challenger.name, tc = %time_control, "Rechallenging");
        if let Err(err) = self.manager.enqueue(vec![request]).await {
            warn!(error = %err, "Failed to queue rechallenge");
        }
    }

    /// Routes one event; false once the manager is gone.
    #[instrument(skip(self, record), fields(kind = %record.kind, key = ?record.key))]
    async fn dispatch(&mut self, record: EventRecord) -> bool {
        if !self.dedup.admit(&record, Instant::now()) {
            debug!("Duplicate event dropped");
            return true;
        }

        let sent = match record.event {
            Event::Challenge { challenge } => {
                self.on_challenge(challenge).await;
                Ok(())
            }
            Event::ChallengeCanceled { challenge } => self.manager.challenge_canceled(challenge.id).await,
            Event::ChallengeDeclined { challenge } => {
                debug!(challenge_id = %challenge.id, "Challenge declined");
                Ok(())
            }
            Event::GameStart { game } => {
                info!(game_id = %game.game_id, opponent = %game.opponent.username, "Game started");
                self.manager.game_started(game).await
            }
            Event::GameFinish { game } => {
                info!(game_id = %game.game_id, "Game finished");
                self.manager.game_finished(game.game_id).await
            }
            Event::Heartbeat => Ok(()),
            Event::Other => {
                debug!("Unhandled event");
                Ok(())
            }
        };

        match sent {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "Manager unavailable");
                false
            }
        }
    }

    async fn on_challenge(&mut self, challenge: Challenge) {
        let challenger = challenge.challenger.as_ref().map(|c| c.id.to_lowercase());
        if challenger.as_deref() == Some(self.username.as_str()) {
            debug!(challenge_id = %challenge.id, "Own challenge echoed");
            return;
        }

        self.last_challenge = Some(challenge.clone());
        match self.validator.validate(&challenge) {
            ChallengeDecision::Accept => {
                info!(challenge_id = %challenge.id, challenger = ?challenger, "Challenge passed filters");
                if let Err(err) = self.manager.incoming_challenge(challenge).await {
                    error!(error = %err, "Manager unavailable");
                }
            }
            ChallengeDecision::Decline(reason) => {
                info!(challenge_id = %challenge.id, challenger = ?challenger, reason = %reason, "Declining challenge");
                if let Err(err) = self.api.decline_challenge(&challenge.id, reason).await {
                    warn!(error = %err, "Failed to decline challenge");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GameId;

    fn finish(id: &str) -> EventRecord {
        let game = serde_json::json!({
            "gameId": id,
            "opponent": {"username": "x"},
            "variant": {"key": "standard"},
            "speed": "blitz"
        });
        let event: Event =
            serde_json::from_value(serde_json::json!({"type": "gameFinish", "game": game})).expect("valid event");
        event.into()
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_window() {
        let mut dedup = DedupWindow::new(Duration::from_secs(10));
        let now = Instant::now();

        assert!(dedup.admit(&finish("g1"), now));
        assert!(!dedup.admit(&finish("g1"), now + Duration::from_secs(5)));
        assert!(dedup.admit(&finish("g2"), now));
        assert!(dedup.admit(&finish("g1"), now + Duration::from_secs(11)));

        let heartbeat = EventRecord::from(Event::Heartbeat);
        assert!(dedup.admit(&heartbeat, now));
        assert!(dedup.admit(&heartbeat, now));
    }

    #[test]
    fn test_record_classification() {
        let record = finish("abc");
        assert_eq!(record.kind, EventKind::GameFinished);
        assert_eq!(record.key.as_deref(), Some(GameId::new("abc").as_str()));
    }
}
