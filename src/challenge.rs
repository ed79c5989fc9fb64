//! Incoming challenge policy.

use std::collections::HashSet;

use tracing::{debug, instrument};

use crate::{Challenge, ChallengeFilter, ChallengeTimeControl, DeclineReason, Variant};

/// Verdict on an incoming challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeDecision {
    /// Queue for acceptance.
    Accept,
    /// Decline with a reason the challenger sees.
    Decline(DeclineReason),
}

/// Applies the configured filters plus runtime black/white lists.
#[derive(Debug, Clone)]
pub struct ChallengeValidator {
    filter: ChallengeFilter,
    blacklist: HashSet<String>,
    whitelist: HashSet<String>,
}

impl ChallengeValidator {
    /// Creates a validator from the configured filter.
    pub fn new(filter: ChallengeFilter) -> Self {
        let blacklist = filter.blacklist.iter().map(|u| u.to_lowercase()).collect();
        let whitelist = filter.whitelist.iter().map(|u| u.to_lowercase()).collect();
        Self {
            filter,
            blacklist,
            whitelist,
        }
    }

    /// Declines every future challenge from `user`.
    pub fn blacklist(&mut self, user: &str) {
        let user = user.to_lowercase();
        self.whitelist.remove(&user);
        self.blacklist.insert(user);
    }

    /// Adds `user` to the accepted users.
    pub fn whitelist(&mut self, user: &str) {
        let user = user.to_lowercase();
        self.blacklist.remove(&user);
        self.whitelist.insert(user);
    }

    /// Whether `user` is blacklisted.
    pub fn is_blacklisted(&self, user: &str) -> bool {
        self.blacklist.contains(&user.to_lowercase())
    }

    /// Decides on `challenge`.
    #[instrument(skip(self, challenge), fields(challenge_id = %challenge.id))]
    pub fn validate(&self, challenge: &Challenge) -> ChallengeDecision {
        let decision = self.check(challenge);
        debug!(decision = ?decision, "Challenge validated");
        decision
    }

    fn check(&self, challenge: &Challenge) -> ChallengeDecision {
        use ChallengeDecision::{Accept, Decline};

        let challenger = challenge.challenger.as_ref();
        let name = challenger.map(|c| c.id.to_lowercase()).unwrap_or_default();

        if !self.whitelist.is_empty() && !self.whitelist.contains(&name) {
            return Decline(DeclineReason::Generic);
        }
        if self.blacklist.contains(&name) {
            return Decline(DeclineReason::Generic);
        }

        let variant = challenge.variant.key;
        if !self.filter.variants.contains(&variant) {
            return Decline(if self.filter.variants == [Variant::Standard] {
                DeclineReason::Standard
            } else {
                DeclineReason::Variant
            });
        }

        if !self.filter.speeds.contains(&challenge.speed) {
            return Decline(DeclineReason::TimeControl);
        }
        if let ChallengeTimeControl::Clock { limit, increment } = challenge.time_control {
            let f = &self.filter;
            if f.min_initial_secs.is_some_and(|min| limit < min) || f.min_increment_secs.is_some_and(|min| increment < min)
            {
                return Decline(DeclineReason::TooFast);
            }
            if f.max_initial_secs.is_some_and(|max| limit > max) || f.max_increment_secs.is_some_and(|max| increment > max)
            {
                return Decline(DeclineReason::TooSlow);
            }
        }

        if challenge.rated && !self.filter.allow_rated {
            return Decline(DeclineReason::Casual);
        }
        if !challenge.rated && !self.filter.allow_casual {
            return Decline(DeclineReason::Rated);
        }

        let is_bot = challenger.is_some_and(|c| c.is_bot());
        if is_bot && !self.filter.allow_bots {
            return Decline(DeclineReason::NoBot);
        }
        if !is_bot && !self.filter.allow_humans {
            return Decline(DeclineReason::OnlyBot);
        }

        if let Some(rating) = challenger.and_then(|c| c.rating) {
            let too_low = self.filter.min_rating.is_some_and(|min| rating < min);
            let too_high = self.filter.max_rating.is_some_and(|max| rating > max);
            if too_low || too_high {
                return Decline(DeclineReason::Generic);
            }
        }

        Accept
    }
}
