//! Lichess Bot API over reqwest.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};

use super::{EventStream, GameStream, RemoteService, decode_ndjson};
use crate::{
    Account, BotError, ChallengeId, ChallengeOutcome, ChallengeRequest, DeclineReason, Event, GameEvent, GameId,
    Opponent,
};

/// Timeout for plain request/response calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Line of a keep-alive challenge response.
#[derive(Debug, Clone, Deserialize)]
struct ChallengeLine {
    #[serde(default)]
    id: Option<ChallengeId>,
    #[serde(default)]
    challenge: Option<ChallengeRef>,
    #[serde(default)]
    done: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChallengeRef {
    id: ChallengeId,
}

/// HTTP client for the Lichess Bot API.
#[derive(Debug, Clone)]
pub struct LichessApi {
    /// Base URL of the server.
    base_url: String,
    /// HTTP client with auth headers.
    client: reqwest::Client,
}

impl LichessApi {
    /// Creates a client authenticated with `token`.
    #[instrument(skip(token))]
    pub fn new(base_url: &str, token: &str) -> Result<Self, BotError> {
        let base_url = base_url.trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| BotError::fatal_auth("Token contains invalid characters"))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("botli/", env!("CARGO_PKG_VERSION"))),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| BotError::exhausted(format!("Failed to build HTTP client: {}", e)))?;

        info!("Created API client");
        Ok(Self { base_url, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends a bodiless POST and checks the status.
    async fn post(&self, path: &str) -> Result<(), BotError> {
        let response = self
            .client
            .post(self.url(path))
            .timeout(CALL_TIMEOUT)
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    /// Sends a form POST and checks the status.
    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> Result<(), BotError> {
        let response = self
            .client
            .post(self.url(path))
            .timeout(CALL_TIMEOUT)
            .form(form)
            .send()
            .await?;
        check(response).await.map(|_| ())
    }
}

/// Maps HTTP failures onto the error taxonomy.
#[instrument(skip(response), fields(status = %response.status(), url = %response.url()))]
async fn check(response: Response) -> Result<Response, BotError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    debug!(body = %body, "Request failed");

    let message = format!("HTTP {}: {}", status, body.trim());
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            error!(status = %status, "Credentials rejected");
            BotError::fatal_auth(message)
        }
        StatusCode::TOO_MANY_REQUESTS => BotError::transient(message),
        s if s.is_server_error() => BotError::transient(message),
        _ => BotError::protocol(message),
    })
}

fn challenge_form(request: &ChallengeRequest) -> Vec<(&'static str, String)> {
    vec![
        ("rated", request.rated.to_string()),
        ("clock.limit", request.time_control.initial.as_secs().to_string()),
        ("clock.increment", request.time_control.increment.as_secs().to_string()),
        ("color", request.color.to_string()),
        ("variant", request.variant.to_string()),
        ("keepAliveStream", "true".to_string()),
    ]
}

#[async_trait::async_trait]
impl RemoteService for LichessApi {
    #[instrument(skip(self))]
    async fn stream_events(&self) -> Result<EventStream, BotError> {
        let response = self.client.get(self.url("/api/stream/event")).send().await?;
        let response = check(response).await?;
        info!("Event stream opened");
        Ok(decode_ndjson(response.bytes_stream(), Some(Event::Heartbeat)))
    }

    #[instrument(skip(self))]
    async fn get_account(&self) -> Result<Account, BotError> {
        let response = self
            .client
            .get(self.url("/api/account"))
            .timeout(CALL_TIMEOUT)
            .send()
            .await?;
        let account: Account = check(response).await?.json().await?;
        debug!(username = %account.username, "Fetched account");
        Ok(account)
    }

    #[instrument(skip(self))]
    async fn upgrade_to_bot(&self) -> Result<(), BotError> {
        self.post("/api/bot/account/upgrade").await
    }

    #[instrument(skip(self), fields(challenge_id = %id))]
    async fn accept_challenge(&self, id: &ChallengeId) -> Result<(), BotError> {
        self.post(&format!("/api/challenge/{}/accept", id)).await
    }

    #[instrument(skip(self), fields(challenge_id = %id))]
    async fn decline_challenge(&self, id: &ChallengeId, reason: DeclineReason) -> Result<(), BotError> {
        self.post_form(&format!("/api/challenge/{}/decline", id), &[("reason", reason.to_string())])
            .await
    }

    #[instrument(skip(self), fields(opponent = %request.opponent, tc = %request.time_control))]
    async fn create_challenge(&self, request: &ChallengeRequest) -> Result<ChallengeOutcome, BotError> {
        let path = match &request.opponent {
            Opponent::User(name) => format!("/api/challenge/{}", name),
            Opponent::Open => "/api/challenge/open".to_string(),
        };

        let response = self
            .client
            .post(self.url(&path))
            .form(&challenge_form(request))
            .send()
            .await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            warn!("Challenge rate limited");
            return Ok(ChallengeOutcome::RateLimited);
        }
        let response = check(response).await?;

        let mut lines = decode_ndjson::<_, _, _, ChallengeLine>(response.bytes_stream(), None);
        let mut challenge_id: Option<ChallengeId> = None;

        while let Some(line) = lines.next().await {
            let line = line?;
            if let Some(message) = line.error {
                return Err(BotError::protocol(format!("Challenge rejected: {}", message)));
            }
            if let Some(id) = line.challenge.map(|c| c.id).or(line.id) {
                debug!(challenge_id = %id, "Challenge created");
                if request.opponent == Opponent::Open {
                    return Ok(ChallengeOutcome::Created(id));
                }
                challenge_id = Some(id);
            }
            if let Some(done) = line.done {
                let id = challenge_id
                    .clone()
                    .ok_or_else(|| BotError::protocol("Challenge finished before it was created"))?;
                info!(challenge_id = %id, done = %done, "Challenge answered");
                return Ok(match done.as_str() {
                    "accepted" => ChallengeOutcome::Accepted(id),
                    "declined" => ChallengeOutcome::Declined { id, reason: None },
                    _ => ChallengeOutcome::Expired(id),
                });
            }
        }

        match challenge_id {
            Some(id) => Ok(ChallengeOutcome::Expired(id)),
            None => Err(BotError::transient("Challenge stream closed without a challenge")),
        }
    }

    #[instrument(skip(self), fields(challenge_id = %id))]
    async fn cancel_challenge(&self, id: &ChallengeId) -> Result<(), BotError> {
        self.post(&format!("/api/challenge/{}/cancel", id)).await
    }

    #[instrument(skip(self), fields(game_id = %id))]
    async fn stream_game_state(&self, id: &GameId) -> Result<GameStream, BotError> {
        let response = self
            .client
            .get(self.url(&format!("/api/bot/game/stream/{}", id)))
            .send()
            .await?;
        let response = check(response).await?;
        debug!("Game stream opened");
        Ok(decode_ndjson::<_, _, _, GameEvent>(response.bytes_stream(), None))
    }

    #[instrument(skip(self), fields(game_id = %id))]
    async fn make_move(&self, id: &GameId, uci: &str, offer_draw: bool) -> Result<(), BotError> {
        let response = self
            .client
            .post(self.url(&format!("/api/bot/game/{}/move/{}", id, uci)))
            .query(&[("offeringDraw", offer_draw)])
            .timeout(CALL_TIMEOUT)
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    #[instrument(skip(self), fields(game_id = %id))]
    async fn resign(&self, id: &GameId) -> Result<(), BotError> {
        self.post(&format!("/api/bot/game/{}/resign", id)).await
    }

    #[instrument(skip(self), fields(game_id = %id))]
    async fn abort(&self, id: &GameId) -> Result<(), BotError> {
        self.post(&format!("/api/bot/game/{}/abort", id)).await
    }

    #[instrument(skip(self), fields(game_id = %id))]
    async fn claim_victory(&self, id: &GameId) -> Result<(), BotError> {
        self.post(&format!("/api/bot/game/{}/claim-victory", id)).await
    }

    #[instrument(skip(self, password))]
    async fn join_tournament(&self, id: &str, team: Option<&str>, password: Option<&str>) -> Result<(), BotError> {
        let mut form = Vec::new();
        if let Some(team) = team {
            form.push(("team", team.to_string()));
        }
        if let Some(password) = password {
            form.push(("password", password.to_string()));
        }
        self.post_form(&format!("/api/tournament/{}/join", id), &form).await
    }

    #[instrument(skip(self))]
    async fn withdraw_tournament(&self, id: &str) -> Result<(), BotError> {
        self.post(&format!("/api/tournament/{}/withdraw", id)).await
    }

    #[instrument(skip(self))]
    async fn online_bots(&self, limit: usize) -> Result<Vec<Account>, BotError> {
        let response = self
            .client
            .get(self.url("/api/bot/online"))
            .query(&[("nb", limit)])
            .timeout(CALL_TIMEOUT)
            .send()
            .await?;
        let response = check(response).await?;

        let mut bots = Vec::new();
        let mut lines = decode_ndjson::<_, _, _, Account>(response.bytes_stream(), None);
        while let Some(bot) = lines.next().await {
            bots.push(bot?);
        }
        debug!(count = bots.len(), "Fetched online bots");
        Ok(bots)
    }
}
