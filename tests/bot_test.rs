//! Tests for bot startup, console commands and shutdown.

mod common;

use std::time::Duration;

use botli::{Bot, BotConfig, BotError, ConsoleCommand, ErrorKind, Event, GameId, TimingConfig};
use common::{Call, EngineScript, FakeLauncher, FakeService, account, game_full, game_start};

fn config() -> BotConfig {
    BotConfig::new(vec!["engine".into()]).with_timing(TimingConfig {
        shutdown_grace_secs: 10,
        ..TimingConfig::default()
    })
}

#[tokio::test(start_paused = true)]
async fn test_start_play_and_shutdown() {
    let api = FakeService::new();
    let events = api.event_connection();
    let game = api.game_connection("g1");
    let bot = Bot::start(config(), api.clone(), FakeLauncher::new(EngineScript::default()), false)
        .await
        .expect("Bot starts");
    assert_eq!(bot.account().id, common::ME);

    events.send(Ok(Event::GameStart { game: game_start("g1") })).expect("send");
    game.send(Ok(game_full("g1", true, "", 180_000, 180_000))).expect("send");
    api.wait_for("move", |c| *c == Call::Move(GameId::new("g1"), "e2e4".into())).await;

    let status = bot.manager().status().await.expect("status");
    assert_eq!(status.active.len(), 1);

    bot.shutdown().await.expect("Clean shutdown");
    // One ply played: the game is aborted rather than resigned.
    assert_eq!(api.count(|c| *c == Call::Abort(GameId::new("g1"))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_reports_fatal_stream_error() {
    let api = FakeService::new();
    api.refuse_events(BotError::fatal_auth("bad token"));
    let mut bot = Bot::start(config(), api.clone(), FakeLauncher::new(EngineScript::default()), false)
        .await
        .expect("Bot starts");

    let err = bot.stopped().await.expect_err("Stream rejected");
    assert_eq!(err.kind, ErrorKind::FatalAuth);

    let pending = tokio::time::timeout(Duration::from_secs(5), bot.stopped()).await;
    assert!(pending.is_err(), "Second wait never resolves");
    bot.shutdown().await.expect("Shutdown after stream end");
}

#[tokio::test(start_paused = true)]
async fn test_console_commands_drive_bot() {
    let api = FakeService::new();
    let _events = api.event_connection();
    let bot = Bot::start(config(), api.clone(), FakeLauncher::new(EngineScript::default()), false)
        .await
        .expect("Bot starts");

    let command: ConsoleCommand = "challenge Rival 3+2 black rated".parse().expect("valid");
    assert!(!command.execute(&bot).await.expect("Command runs"));
    api.wait_for("challenge", |c| matches!(c, Call::Create(_))).await;

    let command: ConsoleCommand = "tournament arena7".parse().expect("valid");
    command.execute(&bot).await.expect("Command runs");
    api.wait_for("join", |c| *c == Call::Join("arena7".into())).await;
    while bot.manager().status().await.expect("status").tournaments.is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let command: ConsoleCommand = "blacklist Spammer".parse().expect("valid");
    command.execute(&bot).await.expect("Command runs");

    let quit: ConsoleCommand = "quit".parse().expect("valid");
    assert!(quit.execute(&bot).await.expect("Command runs"));

    bot.shutdown().await.expect("Clean shutdown");
    assert_eq!(api.count(|c| *c == Call::Withdraw("arena7".into())), 1);
}

#[tokio::test(start_paused = true)]
async fn test_regular_account_needs_upgrade() {
    let mut human = account(common::ME, 1800);
    human.title = None;
    let api = FakeService::with_account(human);
    let _events = api.event_connection();

    let err = match Bot::start(config(), api.clone(), FakeLauncher::new(EngineScript::default()), false).await {
        Ok(_) => panic!("Regular account must not go online"),
        Err(err) => err,
    };
    assert_eq!(err.kind, ErrorKind::FatalAuth);
    assert!(err.message.contains("--upgrade"));
    assert_eq!(api.count(|c| *c == Call::Upgrade), 0);
    assert_eq!(api.count(|c| *c == Call::StreamEvents), 0);
}

#[tokio::test(start_paused = true)]
async fn test_upgrade_converts_regular_account() {
    let mut human = account(common::ME, 1800);
    human.title = None;
    let api = FakeService::with_account(human);
    let _events = api.event_connection();

    let bot = Bot::start(config(), api.clone(), FakeLauncher::new(EngineScript::default()), true)
        .await
        .expect("Bot starts after upgrade");
    assert!(bot.account().is_bot());
    assert_eq!(api.count(|c| *c == Call::Upgrade), 1);

    bot.shutdown().await.expect("Clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_bot_account_is_not_upgraded_again() {
    let api = FakeService::new();
    let _events = api.event_connection();

    let bot = Bot::start(config(), api.clone(), FakeLauncher::new(EngineScript::default()), true)
        .await
        .expect("Bot starts");
    assert_eq!(api.count(|c| *c == Call::Upgrade), 0);
    bot.shutdown().await.expect("Clean shutdown");
}
