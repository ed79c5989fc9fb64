//! Tests for the game manager actor.

mod common;

use std::sync::Arc;
use std::time::Duration;

use botli::{
    BackoffConfig, BotConfig, BotError, ChallengeId, ChallengeOutcome, ChallengeRequest, GameId, GameManager,
    ManagerHandle, ManagerStatus, MatchmakingConfig, MatchmakingType, Opponent, OutgoingConfig, OverflowPolicy,
    SessionState, TimeControl, TimingConfig,
};
use common::{
    Call, EngineScript, FakeLauncher, FakeService, account, challenge, game_full, game_start, game_state,
};

fn config() -> BotConfig {
    BotConfig::new(vec!["engine".into()])
}

fn start(config: BotConfig, api: Arc<FakeService>, launcher: Arc<FakeLauncher>) -> ManagerHandle {
    let me = account(common::ME, 2000);
    let (manager, handle) = GameManager::new(config, me, api, launcher);
    tokio::spawn(manager.run());
    handle
}

async fn wait_status(handle: &ManagerHandle, what: &str, pred: impl Fn(&ManagerStatus) -> bool) -> ManagerStatus {
    let result = tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let status = handle.status().await.expect("Manager answers");
            if pred(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    match result {
        Ok(status) => status,
        Err(_) => panic!("Timed out waiting for {}", what),
    }
}

fn is_active(status: &ManagerStatus, id: &str) -> bool {
    status.active.iter().any(|(game, _)| game.as_str() == id)
}

#[tokio::test(start_paused = true)]
async fn test_ceiling_queues_second_game() {
    let api = FakeService::new();
    let g1 = api.game_connection("g1");
    let g2 = api.game_connection("g2");
    let handle = start(config().with_max_games(1), api.clone(), FakeLauncher::new(EngineScript::default()));

    handle.game_started(game_start("g1")).await.expect("send");
    handle.game_started(game_start("g2")).await.expect("send");
    g1.send(Ok(game_full("g1", true, "", 180_000, 180_000))).expect("send");
    api.wait_for("g1 move", |c| *c == Call::Move(GameId::new("g1"), "e2e4".into()))
        .await;

    let status = handle.status().await.expect("status");
    assert_eq!(status.active.len(), 1);
    assert!(is_active(&status, "g1"));
    assert_eq!(status.pending_games, [GameId::new("g2")]);
    assert_eq!(api.count(|c| *c == Call::StreamGame(GameId::new("g2"))), 0);

    g1.send(Ok(game_state("e2e4 e7e5 g1f3", "mate", Some("white")))).expect("send");
    let status = wait_status(&handle, "g2 to start", |s| is_active(s, "g2")).await;
    assert!(status.pending_games.is_empty());
    assert_eq!(status.completed.len(), 1);
    assert_eq!(status.completed[0].state, SessionState::Closed);

    g2.send(Ok(game_full("g2", true, "", 180_000, 180_000))).expect("send");
    api.wait_for("g2 move", |c| *c == Call::Move(GameId::new("g2"), "e2e4".into()))
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_game_start_ignored() {
    let api = FakeService::new();
    let g1 = api.game_connection("g1");
    let handle = start(config().with_max_games(2), api.clone(), FakeLauncher::new(EngineScript::default()));

    handle.game_started(game_start("g1")).await.expect("send");
    handle.game_started(game_start("g1")).await.expect("send");
    let status = wait_status(&handle, "g1 active", |s| is_active(s, "g1")).await;
    assert_eq!(status.active.len(), 1);

    g1.send(Ok(game_full("g1", true, "e2e4 e7e5", 180_000, 180_000))).expect("send");
    g1.send(Ok(game_state("e2e4 e7e5", "aborted", None))).expect("send");
    wait_status(&handle, "g1 done", |s| s.completed.len() == 1).await;

    // A late repeat of a finished game does not start it again.
    handle.game_started(game_start("g1")).await.expect("send");
    let status = handle.status().await.expect("status");
    assert!(status.active.is_empty());
    assert_eq!(api.count(|c| *c == Call::StreamGame(GameId::new("g1"))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_overflow_abort_policy() {
    let api = FakeService::new();
    let _g1 = api.game_connection("g1");
    let handle = start(
        config().with_max_games(1).with_overflow_policy(OverflowPolicy::Abort),
        api.clone(),
        FakeLauncher::new(EngineScript::default()),
    );

    handle.game_started(game_start("g1")).await.expect("send");
    handle.game_started(game_start("g2")).await.expect("send");
    api.wait_for("abort of g2", |c| *c == Call::Abort(GameId::new("g2"))).await;

    let status = handle.status().await.expect("status");
    assert!(is_active(&status, "g1"));
    assert!(status.pending_games.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_incoming_challenge_reserves_slot() {
    let api = FakeService::new();
    let c1 = api.game_connection("c1");
    let handle = start(config().with_max_games(1), api.clone(), FakeLauncher::new(EngineScript::default()));

    handle
        .incoming_challenge(challenge("c1", "Alice", 180, 2))
        .await
        .expect("send");
    api.wait_for("accept", |c| *c == Call::Accept(ChallengeId::new("c1"))).await;

    // The reserved slot holds back a second challenge.
    handle
        .incoming_challenge(challenge("c2", "Bob", 180, 2))
        .await
        .expect("send");
    let status = handle.status().await.expect("status");
    assert_eq!(status.reserved, 1);
    assert_eq!(status.incoming, 1);

    handle.game_started(game_start("c1")).await.expect("send");
    let status = wait_status(&handle, "c1 active", |s| is_active(s, "c1")).await;
    assert_eq!(status.reserved, 0);
    assert_eq!(status.incoming, 1);

    c1.send(Ok(game_full("c1", true, "e2e4 e7e5", 180_000, 180_000))).expect("send");
    c1.send(Ok(game_state("e2e4 e7e5 d2d4 d7d5", "resign", Some("white")))).expect("send");
    api.wait_for("accept c2", |c| *c == Call::Accept(ChallengeId::new("c2"))).await;
}

#[tokio::test(start_paused = true)]
async fn test_unstarted_reservation_expires() {
    let api = FakeService::new();
    let handle = start(config(), api.clone(), FakeLauncher::new(EngineScript::default()));

    handle
        .incoming_challenge(challenge("c1", "Alice", 180, 2))
        .await
        .expect("send");
    wait_status(&handle, "reservation", |s| s.reserved == 1).await;

    let status = wait_status(&handle, "reservation released", |s| s.reserved == 0).await;
    assert!(status.active.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_declined_challenge_sent_once() {
    let api = FakeService::new();
    api.challenge_outcome(Ok(ChallengeOutcome::Declined {
        id: ChallengeId::new("x1"),
        reason: Some("later".into()),
    }));
    let handle = start(config(), api.clone(), FakeLauncher::new(EngineScript::default()));
    let request = ChallengeRequest::new(Opponent::User("Rival".into()), TimeControl::from_secs(300, 3));

    handle.enqueue(vec![request.clone()]).await.expect("send");
    api.wait_for("challenge", |c| matches!(c, Call::Create(_))).await;
    let status = wait_status(&handle, "challenge answered", |s| !s.challenge_in_flight).await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(status.queued, 0);
    assert_eq!(api.calls().iter().filter(|c| **c == Call::Create(request.clone())).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retried_until_limit() {
    let api = FakeService::new();
    for _ in 0..5 {
        api.challenge_outcome(Err(BotError::transient("server busy")));
    }
    let outgoing = OutgoingConfig {
        cooldown_secs: 0,
        backoff: BackoffConfig {
            initial_ms: 1_000,
            max_ms: 4_000,
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 3,
        },
    };
    let handle = start(
        config().with_outgoing(outgoing),
        api.clone(),
        FakeLauncher::new(EngineScript::default()),
    );

    handle
        .enqueue(vec![ChallengeRequest::new(
            Opponent::User("Rival".into()),
            TimeControl::from_secs(60, 0),
        )])
        .await
        .expect("send");
    tokio::time::sleep(Duration::from_secs(60)).await;

    let status = handle.status().await.expect("status");
    assert_eq!(api.count(|c| matches!(c, Call::Create(_))), 3);
    assert_eq!(status.queued, 0);
    assert!(!status.challenge_in_flight);
}

#[tokio::test(start_paused = true)]
async fn test_clear_queue() {
    let api = FakeService::new();
    let handle = start(config(), api.clone(), FakeLauncher::new(EngineScript::default()));
    let request = ChallengeRequest::new(Opponent::User("Rival".into()), TimeControl::from_secs(60, 0));

    // Same opponent: all but the first wait for the cool-down.
    handle.enqueue(request.pairs(3)).await.expect("send");
    wait_status(&handle, "first challenge sent", |s| s.queued == 5).await;
    handle.clear_queue().await.expect("send");

    let status = handle.status().await.expect("status");
    assert_eq!(status.queued, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_end_sends_without_waiting_for_tick() {
    let api = FakeService::new();
    let handle = start(config(), api.clone(), FakeLauncher::new(EngineScript::default()));
    let request = ChallengeRequest::new(Opponent::User("Rival".into()), TimeControl::from_secs(60, 0));

    // Off the one-second tick grid.
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.enqueue(vec![request.clone(), request]).await.expect("send");
    api.wait_for("first challenge", |c| matches!(c, Call::Create(_))).await;
    let first = tokio::time::Instant::now();

    let result = tokio::time::timeout(Duration::from_secs(60), async {
        while api.count(|c| matches!(c, Call::Create(_))) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "Second challenge never sent");

    let gap = first.elapsed();
    assert!(gap >= Duration::from_millis(29_900), "gap {:?}", gap);
    assert!(gap < Duration::from_millis(30_400), "gap {:?}", gap);
}

#[tokio::test(start_paused = true)]
async fn test_open_challenge_canceled_on_shutdown() {
    let api = FakeService::new();
    api.challenge_outcome(Ok(ChallengeOutcome::Created(ChallengeId::new("open1"))));
    let handle = start(config(), api.clone(), FakeLauncher::new(EngineScript::default()));

    handle
        .enqueue(vec![ChallengeRequest::new(Opponent::Open, TimeControl::from_secs(180, 2))])
        .await
        .expect("send");
    let status = wait_status(&handle, "open challenge created", |s| !s.open_challenges.is_empty()).await;
    assert_eq!(status.open_challenges, [ChallengeId::new("open1")]);

    handle.shutdown().await.expect("Shutdown completes");
    api.wait_for("cancel", |c| *c == Call::Cancel(ChallengeId::new("open1"))).await;
}

#[tokio::test(start_paused = true)]
async fn test_open_challenge_taken_by_game_start() {
    let api = FakeService::new();
    api.challenge_outcome(Ok(ChallengeOutcome::Created(ChallengeId::new("open2"))));
    let game = api.game_connection("open2");
    let handle = start(config(), api.clone(), FakeLauncher::new(EngineScript::default()));

    handle
        .enqueue(vec![ChallengeRequest::new(Opponent::Open, TimeControl::from_secs(180, 2))])
        .await
        .expect("send");
    wait_status(&handle, "open challenge created", |s| !s.open_challenges.is_empty()).await;

    handle.game_started(game_start("open2")).await.expect("send");
    game.send(Ok(game_full("open2", true, "", 180_000, 180_000))).expect("send");
    let status = wait_status(&handle, "open challenge taken", |s| s.open_challenges.is_empty()).await;
    assert!(is_active(&status, "open2"));
    assert_eq!(api.count(|c| matches!(c, Call::Cancel(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_matchmaking_challenges_bot_in_range() {
    let api = FakeService::new();
    api.set_online(vec![account("faraway", 2600), account("rival", 2050)]);
    let matchmaking = MatchmakingConfig {
        types: vec![MatchmakingType {
            time_control: TimeControl::from_secs(180, 2),
            variant: Default::default(),
            rated: true,
            color: Default::default(),
        }],
        ..MatchmakingConfig::default()
    };
    let handle = start(
        config().with_matchmaking(matchmaking),
        api.clone(),
        FakeLauncher::new(EngineScript::default()),
    );

    handle.request_matchmaking(None).await.expect("send");
    api.wait_for("matchmaking challenge", |c| matches!(c, Call::Create(_))).await;

    let created: Vec<ChallengeRequest> = api
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Create(request) => Some(request),
            _ => None,
        })
        .collect();
    assert_eq!(created[0].opponent, Opponent::User("rival".into()));
    assert!(created[0].rated);
    assert_eq!(created[0].time_control, TimeControl::from_secs(180, 2));

    handle.stop_matchmaking().await.expect("send");
    let status = handle.status().await.expect("status");
    assert!(!status.matchmaking);
}

#[tokio::test(start_paused = true)]
async fn test_failed_session_does_not_stop_manager() {
    let api = FakeService::new();
    let g1 = api.game_connection("g1");
    let handle = start(config(), api.clone(), FakeLauncher::failing());

    handle.game_started(game_start("g1")).await.expect("send");
    g1.send(Ok(game_full("g1", true, "", 180_000, 180_000))).expect("send");

    let status = wait_status(&handle, "g1 failed", |s| !s.completed.is_empty()).await;
    assert_eq!(status.completed[0].state, SessionState::Failed);
    assert!(status.active.is_empty());
    assert_eq!(api.count(|c| *c == Call::Abort(GameId::new("g1"))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_resigns_after_grace() {
    let api = FakeService::new();
    let g1 = api.game_connection("g1");
    let timing = TimingConfig {
        shutdown_grace_secs: 5,
        ..TimingConfig::default()
    };
    let handle = start(
        config().with_timing(timing),
        api.clone(),
        FakeLauncher::new(EngineScript::default()),
    );

    handle.request_tournament_joining("arena1", None, None).await.expect("send");
    wait_status(&handle, "tournament joined", |s| s.tournaments == ["arena1"]).await;

    handle.game_started(game_start("g1")).await.expect("send");
    g1.send(Ok(game_full("g1", false, "e2e4 e7e5 g1f3", 180_000, 180_000))).expect("send");
    api.wait_for("g1 move", |c| matches!(c, Call::Move(..))).await;

    let started = tokio::time::Instant::now();
    handle.shutdown().await.expect("Shutdown completes");

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(api.count(|c| *c == Call::Resign(GameId::new("g1"))), 1);
    assert_eq!(api.count(|c| *c == Call::Withdraw("arena1".into())), 1);
    assert!(handle.status().await.is_err(), "Manager stopped");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_lets_games_finish() {
    let api = FakeService::new();
    let g1 = api.game_connection("g1");
    let handle = start(config(), api.clone(), FakeLauncher::new(EngineScript::default()));

    handle.game_started(game_start("g1")).await.expect("send");
    g1.send(Ok(game_full("g1", false, "e2e4 e7e5 g1f3", 180_000, 180_000))).expect("send");
    api.wait_for("g1 move", |c| matches!(c, Call::Move(..))).await;

    let shutdown = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.shutdown().await })
    };
    let status = wait_status(&handle, "shutdown begun", |s| s.shutting_down).await;
    assert!(is_active(&status, "g1"));

    // New work is refused while shutting down.
    handle
        .incoming_challenge(challenge("late", "Carol", 180, 2))
        .await
        .expect("send");
    api.wait_for("decline", |c| matches!(c, Call::Decline(id, _) if id.as_str() == "late"))
        .await;

    g1.send(Ok(game_state("e2e4 e7e5 g1f3 e7e5 f1c4", "mate", Some("black")))).expect("send");
    shutdown.await.expect("Shutdown task").expect("Shutdown completes");

    assert_eq!(api.count(|c| matches!(c, Call::Resign(_))), 0);
}
