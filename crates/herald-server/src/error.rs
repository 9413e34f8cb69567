use herald_contracts::{ConversationId, RequestId};
use thiserror::Error;

/// Failure talking to the chat platform.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Network trouble, rate limiting, 5xx. Worth another attempt.
    #[error("transient transport failure: {0}")]
    Retryable(String),
    /// The platform refused the request; retrying will not help.
    #[error("transport rejected request: {0}")]
    Rejected(String),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: String },
    #[error("notifier is stopped")]
    Stopped,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Retryable(_))
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("conversation {0} is not authorized")]
    Unauthorized(ConversationId),
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("bridge is shutting down")]
    ShuttingDown,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("prompt store failure: {0}")]
    Store(String),
    #[error("startup failed: {0}")]
    Startup(String),
}

impl From<rusqlite::Error> for BridgeError {
    fn from(err: rusqlite::Error) -> Self {
        BridgeError::Store(err.to_string())
    }
}
