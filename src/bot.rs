//! Wiring of manager and event handler.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::{
    Account, BotConfig, BotError, ChallengeValidator, EngineLauncher, EventHandler, EventHandlerHandle, GameManager,
    ManagerHandle, RemoteService,
};

/// A started bot: manager and event stream running as tasks.
pub struct RunningBot {
    account: Account,
    manager: ManagerHandle,
    events: EventHandlerHandle,
    manager_task: Option<JoinHandle<()>>,
    event_task: Option<JoinHandle<Result<(), BotError>>>,
}

/// Entry point of the bot.
pub struct Bot;

impl Bot {
    /// Fetches the account and starts the manager and event handler.
    ///
    /// Fails with a fatal-auth error when the token is rejected, or when the
    /// account is not a bot account and `upgrade` is false. With `upgrade`
    /// a regular account is turned into a bot account first.
    #[instrument(skip_all, fields(upgrade = upgrade))]
    pub async fn start(
        config: BotConfig,
        api: Arc<dyn RemoteService>,
        launcher: Arc<dyn EngineLauncher>,
        upgrade: bool,
    ) -> Result<RunningBot, BotError> {
        let mut account = api.get_account().await?;
        if !account.is_bot() {
            if !upgrade {
                return Err(BotError::fatal_auth(format!(
                    "{} is not a bot account; start with --upgrade to convert it",
                    account.username
                )));
            }
            warn!(username = %account.username, "Upgrading to a bot account");
            api.upgrade_to_bot().await?;
            account.title = Some("BOT".to_string());
            info!(username = %account.username, "Account upgraded");
        }
        info!(username = %account.username, max_games = config.max_games(), "Starting bot");

        let validator = ChallengeValidator::new(config.challenge().clone());
        let stream = *config.stream();
        let (manager, manager_handle) = GameManager::new(config, account.clone(), api.clone(), launcher);
        let (events, events_handle) = EventHandler::new(api, manager_handle.clone(), validator, stream, &account.id);

        let manager_task = tokio::spawn(manager.run());
        let event_task = tokio::spawn(events.run());

        Ok(RunningBot {
            account,
            manager: manager_handle,
            events: events_handle,
            manager_task: Some(manager_task),
            event_task: Some(event_task),
        })
    }
}

impl RunningBot {
    /// Our account.
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Manager entry point.
    pub fn manager(&self) -> &ManagerHandle {
        &self.manager
    }

    /// Event handler entry point.
    pub fn events(&self) -> &EventHandlerHandle {
        &self.events
    }

    /// Waits until the event handler ends on its own.
    ///
    /// Pending forever once already awaited.
    pub async fn stopped(&mut self) -> Result<(), BotError> {
        let Some(task) = self.event_task.as_mut() else {
            return std::future::pending().await;
        };
        let result = join(task.await);
        self.event_task = None;
        result
    }

    /// Stops accepting work, lets or makes games end, then closes the event stream.
    #[instrument(skip(self))]
    pub async fn shutdown(mut self) -> Result<(), BotError> {
        info!("Shutting down bot");
        if let Err(err) = self.manager.shutdown().await {
            warn!(error = %err, "Manager already stopped");
        }
        if let Some(task) = self.manager_task.take() {
            if let Err(err) = task.await {
                error!(error = %err, "Manager task crashed");
            }
        }

        self.events.stop();
        match self.event_task.take() {
            Some(task) => join(task.await),
            None => Ok(()),
        }
    }
}

fn join(result: Result<Result<(), BotError>, tokio::task::JoinError>) -> Result<(), BotError> {
    result.map_err(|e| BotError::invariant(format!("Event handler crashed: {}", e)))?
}
