use thiserror::Error;

/// Structured error taxonomy for the controller, per the error handling design.
///
/// `Configuration` errors are fatal at startup. `Connection`, `EntityNotFound`
/// and `ServiceCall` are recoverable and non-fatal: the controller logs them
/// and continues running in its last known state. `State` errors indicate a
/// programmer error (invalid state-machine operation) and are surfaced to the
/// caller. `Validation` errors are dropped silently at debug level and never
/// propagate past the point where the invalid input was produced.
#[derive(Debug, Error)]
pub enum HagError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("service call failed: {0}")]
    ServiceCall(String),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Invalid operations against the HVAC state machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("event delivered to a stopped state machine")]
    NotRunning,

    #[error("start() called on an already-running state machine")]
    AlreadyRunning,
}

pub type HagResult<T> = Result<T, HagError>;
