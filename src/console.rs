//! Interactive console commands.

use std::str::FromStr;

use derive_more::{Display, Error};
use tracing::{info, instrument};

use crate::{BotError, ChallengeColor, ChallengeRequest, Opponent, PerfType, RunningBot, TimeControl, Variant};

/// Help text listing every command.
pub const HELP: &str = "\
blacklist USER                       Decline USER and skip them in matchmaking
challenge USER [TC] [COLOR] [rated|casual] [VARIANT]
                                     Queue a challenge, TC like 3+2
clear                                Drop every queued challenge
create COUNT USER [TC] [rated|casual] [VARIANT]
                                     Queue COUNT color-swapped pairs
help                                 Show this text
leave ID                             Leave a tournament
matchmaking [PERF]                   Start matchmaking
quit                                 Finish running games and exit
rechallenge                          Challenge the last challenger back
reset PERF                           Reset matchmaking radius of PERF
stop                                 Stop matchmaking
tournament ID [TEAM] [PASSWORD]      Join a tournament
whitelist USER                       Accept USER even with a whitelist";

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Decline and skip a user.
    Blacklist(String),
    /// Queue one challenge.
    Challenge(ChallengeRequest),
    /// Drop the challenge queue.
    Clear,
    /// Queue color-swapped pairs.
    Create {
        /// Number of pairs.
        count: usize,
        /// Template request.
        request: ChallengeRequest,
    },
    /// Show help.
    Help,
    /// Leave a tournament.
    Leave(String),
    /// Start matchmaking.
    Matchmaking(Option<PerfType>),
    /// Graceful exit.
    Quit,
    /// Challenge the last challenger back.
    Rechallenge,
    /// Reset matchmaking state of a perf type.
    Reset(PerfType),
    /// Stop matchmaking.
    Stop,
    /// Join a tournament.
    Tournament {
        /// Tournament id.
        id: String,
        /// Team.
        team: Option<String>,
        /// Password.
        password: Option<String>,
    },
    /// Accept a user.
    Whitelist(String),
}

/// Unparseable console input.
#[derive(Debug, Clone, Display, Error)]
#[display("Console error: {} at {}:{}", message, file, line)]
pub struct ConsoleError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl ConsoleError {
    /// Creates a new console error.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            message: message.into(),
            line: loc.line(),
            file: loc.file(),
        }
    }
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Err(ConsoleError::new("Empty command"));
        };
        let args: Vec<&str> = words.collect();

        let command = match name.to_lowercase().as_str() {
            "blacklist" => ConsoleCommand::Blacklist(required(&args, 0, "USER")?.to_string()),
            "challenge" => ConsoleCommand::Challenge(parse_challenge(
                required(&args, 0, "USER")?,
                &args[1..],
                true,
            )?),
            "clear" => ConsoleCommand::Clear,
            "create" => {
                let count = required(&args, 0, "COUNT")?
                    .parse()
                    .map_err(|_| ConsoleError::new("COUNT must be a number"))?;
                let user = required(&args, 1, "USER")?;
                ConsoleCommand::Create {
                    count,
                    request: parse_challenge(user, &args[2..], false)?,
                }
            }
            "help" => ConsoleCommand::Help,
            "leave" => ConsoleCommand::Leave(required(&args, 0, "ID")?.to_string()),
            "matchmaking" => ConsoleCommand::Matchmaking(args.first().map(|p| parse_perf(p)).transpose()?),
            "quit" | "exit" => ConsoleCommand::Quit,
            "rechallenge" => ConsoleCommand::Rechallenge,
            "reset" => ConsoleCommand::Reset(parse_perf(required(&args, 0, "PERF")?)?),
            "stop" => ConsoleCommand::Stop,
            "tournament" => ConsoleCommand::Tournament {
                id: required(&args, 0, "ID")?.to_string(),
                team: args.get(1).map(|s| s.to_string()),
                password: args.get(2).map(|s| s.to_string()),
            },
            "whitelist" => ConsoleCommand::Whitelist(required(&args, 0, "USER")?.to_string()),
            other => return Err(ConsoleError::new(format!("Unknown command {}, try help", other))),
        };
        Ok(command)
    }
}

fn required<'a>(args: &[&'a str], index: usize, what: &str) -> Result<&'a str, ConsoleError> {
    args.get(index)
        .copied()
        .ok_or_else(|| ConsoleError::new(format!("Missing {}", what)))
}

fn parse_perf(text: &str) -> Result<PerfType, ConsoleError> {
    text.parse()
        .map_err(|_| ConsoleError::new(format!("Unknown perf type {}", text)))
}

/// `[TC] [COLOR] [rated|casual] [VARIANT]`, in any order after the user.
fn parse_challenge(user: &str, rest: &[&str], allow_color: bool) -> Result<ChallengeRequest, ConsoleError> {
    let mut request = ChallengeRequest::new(Opponent::User(user.to_string()), TimeControl::from_secs(60, 1));

    for word in rest {
        let lower = word.to_lowercase();
        if word.contains('+') {
            request.time_control = word
                .parse()
                .map_err(|e: BotError| ConsoleError::new(e.message))?;
        } else if lower == "rated" {
            request.rated = true;
        } else if lower == "casual" {
            request.rated = false;
        } else if let (true, Ok(color)) = (allow_color, ChallengeColor::from_str(&lower)) {
            request.color = color;
        } else if let Ok(variant) = Variant::from_str(word) {
            request.variant = variant;
        } else {
            return Err(ConsoleError::new(format!("Unexpected argument {}", word)));
        }
    }
    Ok(request)
}

impl ConsoleCommand {
    /// Runs the command; returns true when the bot should exit.
    #[instrument(skip(bot))]
    pub async fn execute(self, bot: &RunningBot) -> Result<bool, BotError> {
        match self {
            ConsoleCommand::Blacklist(user) => {
                bot.events().blacklist(user.clone())?;
                bot.manager().blacklist(user).await?;
            }
            ConsoleCommand::Challenge(request) => bot.manager().enqueue(vec![request]).await?,
            ConsoleCommand::Clear => bot.manager().clear_queue().await?,
            ConsoleCommand::Create { count, request } => bot.manager().enqueue(request.pairs(count)).await?,
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Leave(id) => bot.manager().leave_tournament(id).await?,
            ConsoleCommand::Matchmaking(perf) => bot.manager().request_matchmaking(perf).await?,
            ConsoleCommand::Quit => return Ok(true),
            ConsoleCommand::Rechallenge => bot.events().rechallenge()?,
            ConsoleCommand::Reset(perf) => bot.manager().reset_matchmaking(perf).await?,
            ConsoleCommand::Stop => bot.manager().stop_matchmaking().await?,
            ConsoleCommand::Tournament { id, team, password } => {
                bot.manager().request_tournament_joining(id, team, password).await?
            }
            ConsoleCommand::Whitelist(user) => bot.events().whitelist(user)?,
        }
        info!("Command done");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let command: ConsoleCommand = "challenge Bob 5+3 white rated".parse().expect("valid");
        let ConsoleCommand::Challenge(request) = command else {
            panic!("Expected challenge");
        };
        assert_eq!(request.opponent, Opponent::User("Bob".into()));
        assert_eq!(request.time_control, TimeControl::from_secs(300, 3));
        assert_eq!(request.color, ChallengeColor::White);
        assert!(request.rated);
    }

    #[test]
    fn test_parse_create_and_others() {
        let command: ConsoleCommand = "create 2 alice 1+0 atomic".parse().expect("valid");
        let ConsoleCommand::Create { count, request } = command else {
            panic!("Expected create");
        };
        assert_eq!(count, 2);
        assert_eq!(request.variant, Variant::Atomic);

        assert_eq!("matchmaking".parse::<ConsoleCommand>().ok(), Some(ConsoleCommand::Matchmaking(None)));
        assert_eq!(
            "reset blitz".parse::<ConsoleCommand>().ok(),
            Some(ConsoleCommand::Reset(PerfType::Blitz))
        );
        assert_eq!(
            "tournament abc team1".parse::<ConsoleCommand>().ok(),
            Some(ConsoleCommand::Tournament {
                id: "abc".into(),
                team: Some("team1".into()),
                password: None
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<ConsoleCommand>().is_err());
        assert!("dance".parse::<ConsoleCommand>().is_err());
        assert!("blacklist".parse::<ConsoleCommand>().is_err());
        assert!("create x bob".parse::<ConsoleCommand>().is_err());
        assert!("challenge bob 5+3 purple".parse::<ConsoleCommand>().is_err());
    }
}
