//! Matchmaking: picks opponents from the online bot pool.

use std::collections::HashMap;

use rand::seq::IndexedRandom;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::{Account, ChallengeRequest, MatchmakingConfig, MatchmakingType, Opponent, PerfType};

/// Matchmaking state owned by the manager.
#[derive(Debug)]
pub struct Matchmaking {
    config: MatchmakingConfig,
    enabled: bool,
    only: Option<PerfType>,
    next_type: usize,
    radius: HashMap<PerfType, i32>,
    recent: HashMap<(PerfType, String), Instant>,
    last_cycle: Option<Instant>,
    due: bool,
}

impl Matchmaking {
    /// Creates disabled matchmaking.
    pub fn new(config: MatchmakingConfig) -> Self {
        Self {
            config,
            enabled: false,
            only: None,
            next_type: 0,
            radius: HashMap::new(),
            recent: HashMap::new(),
            last_cycle: None,
            due: false,
        }
    }

    /// Whether matchmaking runs.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Starts matchmaking, optionally limited to one perf type.
    #[instrument(skip(self))]
    pub fn enable(&mut self, only: Option<PerfType>) {
        self.enabled = true;
        self.only = only;
        self.due = true;
        info!(types = self.config.types.len(), "Matchmaking enabled");
    }

    /// Stops matchmaking.
    pub fn disable(&mut self) {
        if self.enabled {
            info!("Matchmaking disabled");
        }
        self.enabled = false;
    }

    /// Asks for a cycle as soon as the bot is idle.
    pub fn trigger(&mut self) {
        self.due = true;
    }

    /// Forgets search radius and recent opponents of `perf`.
    #[instrument(skip(self))]
    pub fn reset(&mut self, perf: PerfType) {
        self.radius.remove(&perf);
        self.recent.retain(|(p, _), _| *p != perf);
        info!("Matchmaking state reset");
    }

    /// Current search radius of `perf`.
    pub fn radius(&self, perf: PerfType) -> i32 {
        self.radius
            .get(&perf)
            .copied()
            .unwrap_or(self.config.initial_rating_diff)
    }

    /// Whether a cycle should start now, given that the bot is idle.
    pub fn should_cycle(&self, now: Instant) -> bool {
        if !self.enabled || self.types().next().is_none() {
            return false;
        }
        self.due
            || self
                .last_cycle
                .is_none_or(|last| now.duration_since(last) >= self.config.interval())
    }

    /// Starts a cycle: returns the flavor to look for.
    pub fn begin_cycle(&mut self, now: Instant) -> Option<MatchmakingType> {
        let types: Vec<MatchmakingType> = self.types().cloned().collect();
        if types.is_empty() {
            return None;
        }
        let chosen = types[self.next_type % types.len()].clone();
        self.next_type = self.next_type.wrapping_add(1);
        self.last_cycle = Some(now);
        self.due = false;
        Some(chosen)
    }

    /// Number of bots to request per cycle.
    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    /// Picks an opponent from `pool`, widening the radius when nobody fits.
    #[instrument(skip(self, pool, kind, me, is_blacklisted), fields(pool = pool.len(), tc = %kind.time_control))]
    pub fn select(
        &mut self,
        kind: &MatchmakingType,
        pool: &[Account],
        me: &Account,
        is_blacklisted: impl Fn(&str) -> bool,
        now: Instant,
    ) -> Option<ChallengeRequest> {
        let perf = PerfType::new(kind.variant, kind.time_control.speed());
        let own_rating = me.rating(perf).unwrap_or(1500);
        let radius = self.radius(perf);
        let window = self.config.recent_opponent_window();

        self.recent.retain(|_, at| now.duration_since(*at) < window);

        let candidates: Vec<&Account> = pool
            .iter()
            .filter(|bot| bot.id != me.id && !bot.disabled && !bot.tos_violation)
            .filter(|bot| !is_blacklisted(&bot.id))
            .filter(|bot| !self.recent.contains_key(&(perf, bot.id.clone())))
            .filter(|bot| {
                bot.rating(perf)
                    .is_some_and(|rating| (rating - own_rating).abs() <= radius)
            })
            .collect();

        let Some(opponent) = candidates.choose(&mut rand::rng()) else {
            let widened = (radius + self.config.rating_diff_step).min(self.config.max_rating_diff);
            debug!(perf = %perf, radius, widened, "No opponent in range");
            self.radius.insert(perf, widened);
            return None;
        };

        info!(perf = %perf, opponent = %opponent.username, candidates = candidates.len(), "Matchmaking picked opponent");
        self.record(perf, &opponent.id, now);
        Some(
            ChallengeRequest::new(Opponent::User(opponent.username.clone()), kind.time_control)
                .with_color(kind.color)
                .with_rated(kind.rated)
                .with_variant(kind.variant),
        )
    }

    /// Remembers that `opponent` was played or declined in `perf`.
    pub fn record(&mut self, perf: PerfType, opponent: &str, now: Instant) {
        self.recent.insert((perf, opponent.to_lowercase()), now);
    }

    fn types(&self) -> impl Iterator<Item = &MatchmakingType> {
        self.config.types.iter().filter(move |kind| {
            self.only
                .is_none_or(|perf| PerfType::new(kind.variant, kind.time_control.speed()) == perf)
        })
    }
}
