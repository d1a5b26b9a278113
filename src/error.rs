//! Error types for the orchestrator and its engine seam.

use thiserror::Error;

use crate::orchestrator::LifecycleState;

/// Errors surfaced by the container engine layer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine API call failed.
    #[error("engine API error: {0}")]
    Api(#[from] bollard::errors::Error),

    /// The referenced container or volume does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The endpoint string could not be understood.
    #[error("invalid engine endpoint: {0}")]
    Endpoint(String),

    /// The requested transport is not compiled in.
    #[error("unsupported engine transport: {0}")]
    Unsupported(&'static str),

    /// Engine-side failure outside the typed cases.
    #[error("engine error: {0}")]
    Other(String),
}

/// Errors surfaced by the lifecycle orchestration core.
///
/// Essential-path variants carry the user id so callers can attribute
/// failures without extra context. Best-effort bootstrap failures never
/// appear here; they are logged and swallowed.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The caller declined to wait while provisioning is in flight.
    #[error("container for user {user_id} is not ready yet (state: {state})")]
    NotReady {
        user_id: String,
        state: LifecycleState,
    },

    /// A critical step of the create/start/health path failed.
    #[error("container provisioning failed for user {user_id}: {reason}")]
    CreationFailed { user_id: String, reason: String },

    /// No container record exists for the user.
    #[error("no container for user {user_id}")]
    NoContainer { user_id: String },

    /// A bounded wait (readiness, removal, stable-state) expired.
    #[error("timed out after {seconds}s waiting for {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// A persisted state document could not be deserialized.
    ///
    /// Never escalated past the state store: a corrupt row is treated as if
    /// the user never had state, so a fresh machine can be created.
    #[error("corrupted persisted state for user {user_id}: {reason}")]
    CorruptedState { user_id: String, reason: String },

    /// A state machine was asked to take an edge outside the transition table.
    #[error("illegal lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    /// Engine-layer failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Durable store failure.
    #[error("state store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// State document could not be serialized for persistence.
    #[error("state serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Host filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised while resolving configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },

    /// An environment variable held non-UTF-8 data.
    #[error("environment variable {0} is not valid UTF-8")]
    NotUnicode(String),
}

/// Result alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;
