use crate::session_state::SessionId;

/// Failure taxonomy shared by every component of a voice session.
///
/// Only `ConnectionFailure` after the restart budget is spent and
/// `StoreUnavailable` while starting a session end the session. Everything
/// else is reported to the client as an informational event.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("connection to the conversational service failed: {0}")]
    ConnectionFailure(String),
    #[error("failed to persist turn: {0}")]
    PersistenceFailure(String),
    #[error("scoring failed: {0}")]
    ScoringFailure(String),
    #[error("invalid session state: expected {expected}, found {actual}")]
    InvalidSessionState {
        expected: &'static str,
        actual: &'static str,
    },
}

impl Error {
    /// Whether this error ends the session it was raised in.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::ConnectionFailure(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
