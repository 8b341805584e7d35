//! Error types for the exchange engine.
//!
//! Handler failures are converted into terminal states at the task boundary.
//! Construction errors fail closed: invalid values are rejected, not clamped.

use thiserror::Error;

use crate::exchange::ProcessState;

/// Failure returned by a workflow step.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("deadline exceeded")]
    Timeout,

    #[error("interrupted")]
    Interrupted,

    #[error("response buffer overflow: {attempted} bytes exceeds capacity {capacity}")]
    ResponseOverflow { capacity: usize, attempted: usize },

    #[error("request buffer overflow: limit {limit} bytes")]
    RequestOverflow { limit: usize },

    #[error("capacity exceeded: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    /// Convenience constructor for generic failures.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Terminal state this failure resolves to.
    ///
    /// Timeout-shaped and interruption-shaped causes map to their specific
    /// states, including I/O errors of kind `TimedOut` and `Interrupted`.
    pub fn terminal_state(&self) -> ProcessState {
        match self {
            Self::Timeout => ProcessState::Timeout,
            Self::Interrupted => ProcessState::Interrupted,
            Self::ResponseOverflow { .. } => ProcessState::ResponseBufferOverflow,
            Self::RequestOverflow { .. } => ProcessState::RequestBufferOverflow,
            Self::Rejected(_) => ProcessState::Rejected,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => ProcessState::Timeout,
                std::io::ErrorKind::Interrupted => ProcessState::Interrupted,
                _ => ProcessState::Exception,
            },
            Self::Failed(_) => ProcessState::Exception,
        }
    }
}

/// Errors from exchange construction and registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("timeout must be greater than zero")]
    InvalidTimeout,

    #[error("response capacity must be greater than zero")]
    InvalidCapacity,

    #[error("on-terminal callback already registered for exchange {0}")]
    CallbackAlreadyRegistered(u64),
}

/// Errors raised while validating a workflow against the engine it attaches to.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("step '{step}' is blocking but no blocking pool is configured")]
    BlockingStepWithoutPool { step: String },
}

/// Invalid engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
}

/// Top-level engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("failed to build async runtime: {0}")]
    Runtime(String),

    #[error("failed to spawn thread: {0}")]
    ThreadSpawnFailed(String),

    #[error("engine is shut down")]
    Shutdown,
}
