//! Outgoing challenge queue.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use derive_new::new;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::{ChallengeRequest, Opponent, OutgoingConfig};

/// Who asked for a queued challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ChallengeOrigin {
    /// Console or API caller.
    User,
    /// Matchmaking.
    Matchmaking,
}

/// A challenge waiting to be sent.
#[derive(Debug, Clone, new)]
pub struct QueuedChallenge {
    /// The immutable request.
    pub request: ChallengeRequest,
    /// Who enqueued it.
    pub origin: ChallengeOrigin,
    /// Failed sends so far.
    #[new(default)]
    pub attempts: u32,
    /// Earliest time of the next send.
    #[new(value = "Instant::now()")]
    pub not_before: Instant,
}

/// What to do with an entry whose send failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Back in the queue until the given time.
    Retry(Instant),
    /// Dropped for good.
    GaveUp,
}

/// FIFO of outgoing challenges with per-user cool-down.
#[derive(Debug)]
pub struct ChallengeQueue {
    config: OutgoingConfig,
    entries: VecDeque<QueuedChallenge>,
    last_sent: HashMap<String, Instant>,
}

impl ChallengeQueue {
    /// Creates an empty queue.
    pub fn new(config: OutgoingConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            last_sent: HashMap::new(),
        }
    }

    /// Number of waiting entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing waits.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an entry.
    pub fn push(&mut self, entry: QueuedChallenge) {
        debug!(opponent = %entry.request.opponent, tc = %entry.request.time_control, "Challenge queued");
        self.entries.push_back(entry);
    }

    /// Drops every waiting entry and returns how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Removes and returns the first entry that may be sent at `now`.
    ///
    /// Entries held back by a retry delay or a cool-down keep their place.
    pub fn pop_ready(&mut self, now: Instant) -> Option<QueuedChallenge> {
        let cooldown = self.config.cooldown();
        self.last_sent.retain(|_, sent| now < *sent + cooldown);

        let index = self
            .entries
            .iter()
            .position(|entry| entry.not_before <= now && !self.cooling_down(&entry.request.opponent, now))?;
        let entry = self.entries.remove(index)?;
        if let Opponent::User(name) = &entry.request.opponent {
            self.last_sent.insert(name.to_lowercase(), now);
        }
        Some(entry)
    }

    /// Puts a failed entry back at the front, or drops it after `max_attempts`.
    #[instrument(skip(self, entry), fields(opponent = %entry.request.opponent, attempts = entry.attempts))]
    pub fn retry(&mut self, mut entry: QueuedChallenge, now: Instant) -> RetryVerdict {
        entry.attempts += 1;
        if entry.attempts >= self.config.backoff.max_attempts {
            warn!("Challenge dropped after too many attempts");
            return RetryVerdict::GaveUp;
        }

        let delay = self.config.backoff.base_delay(entry.attempts - 1);
        entry.not_before = now + delay;
        debug!(delay_ms = delay.as_millis() as u64, "Challenge will be retried");
        let not_before = entry.not_before;
        self.entries.push_front(entry);
        RetryVerdict::Retry(not_before)
    }

    /// Time until the next entry could become ready, if any entry waits.
    pub fn next_wakeup(&self, now: Instant) -> Option<Duration> {
        self.entries
            .iter()
            .map(|entry| {
                let cooldown_end = match &entry.request.opponent {
                    Opponent::User(name) => self
                        .last_sent
                        .get(&name.to_lowercase())
                        .map(|sent| *sent + self.config.cooldown())
                        .unwrap_or(now),
                    Opponent::Open => now,
                };
                entry.not_before.max(cooldown_end).saturating_duration_since(now)
            })
            .min()
    }

    fn cooling_down(&self, opponent: &Opponent, now: Instant) -> bool {
        match opponent {
            Opponent::User(name) => self
                .last_sent
                .get(&name.to_lowercase())
                .is_some_and(|sent| now < *sent + self.config.cooldown()),
            Opponent::Open => false,
        }
    }
}
