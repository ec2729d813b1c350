//! Error types for the action bus

use thiserror::Error;

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Error kinds surfaced by the action bus
///
/// Public operations never return these directly; boundaries translate
/// every error into a [`Response`](crate::response::Response). The enum
/// exists for the internal layers and for callers of the lower-level
/// scheduler API.
#[derive(Error, Debug)]
pub enum BusError {
    /// Invalid channel or group configuration
    #[error("Registration error: {0}")]
    Registration(String),

    /// System gate refused the operation (locked, shut down, uninitialized)
    #[error("Gate refused: {0}")]
    Gate(String),

    /// Pipeline denied the call
    #[error("Blocked: {0}")]
    Blocked(String),

    /// Channel or timer not found
    #[error("{0} not found")]
    NotFound(String),

    /// Scheduler rejected a timer request
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// User handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// User handler exceeded its configured timeout
    #[error("Handler timed out after {0}ms")]
    Timeout(u64),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BusError {
    /// Short tag for sensor metadata
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::Registration(_) => "registration",
            BusError::Gate(_) => "gate",
            BusError::Blocked(_) => "blocked",
            BusError::NotFound(_) => "not_found",
            BusError::Scheduler(_) => "scheduler",
            BusError::Handler(_) => "handler",
            BusError::Timeout(_) => "timeout",
            BusError::Internal(_) => "internal",
        }
    }
}
