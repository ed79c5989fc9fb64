//! Bot error types.

use derive_more::{Display, Error};
use tracing::instrument;

/// Failure class of a [`BotError`].
///
/// The class decides who handles the failure: transient errors are retried by
/// the component that owns the connection, fatal-auth errors end the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorKind {
    /// Stream drop or a single call that timed out or failed in transport.
    #[display("transient network")]
    TransientNetwork,
    /// Malformed event, unexpected server reply or unparseable engine output.
    #[display("protocol violation")]
    ProtocolViolation,
    /// Engine process failed to start or no capacity was left for a game.
    #[display("resource exhaustion")]
    ResourceExhaustion,
    /// Credentials rejected by the server.
    #[display("fatal auth")]
    FatalAuth,
    /// A programming invariant was broken.
    #[display("invariant")]
    Invariant,
    /// The engine missed its hard deadline and was killed.
    #[display("engine timeout")]
    EngineTimeout,
}

/// Bot error with failure class and location tracking.
#[derive(Debug, Clone, Display, Error)]
#[display("{} error: {} at {}:{}", kind, message, file, line)]
pub struct BotError {
    /// Failure class.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl BotError {
    /// Creates a new error with caller location tracking.
    #[track_caller]
    #[instrument(skip(message))]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            kind,
            message: message.into(),
            line: loc.line(),
            file: loc.file(),
        }
    }

    /// Creates a transient network error.
    #[track_caller]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientNetwork, message)
    }

    /// Creates a protocol violation error.
    #[track_caller]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, message)
    }

    /// Creates a resource exhaustion error.
    #[track_caller]
    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhaustion, message)
    }

    /// Creates a fatal authentication error.
    #[track_caller]
    pub fn fatal_auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FatalAuth, message)
    }

    /// Creates an invariant violation error.
    #[track_caller]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invariant, message)
    }

    /// Creates an engine timeout error.
    #[track_caller]
    pub fn engine_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EngineTimeout, message)
    }

    /// Whether the owner of the connection should retry.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::TransientNetwork
    }

    /// Whether the error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::FatalAuth
    }
}

impl From<reqwest::Error> for BotError {
    #[track_caller]
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::protocol(format!("Undecodable response: {}", err))
        } else {
            Self::transient(format!("HTTP error: {}", err))
        }
    }
}

impl From<serde_json::Error> for BotError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::protocol(format!("Malformed JSON: {}", err))
    }
}
