//! Error types for the job engine.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by the validation gate before a job is admitted to the queue.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("No runnable registered for type {kind}")]
    UnknownRunnable { kind: String },

    #[error("Runnable type {kind} is already registered")]
    DuplicateRunnable { kind: String },

    #[error("Runnable type {kind} is reserved for internal use")]
    ReservedRunnable { kind: String },

    #[error("Job {id} is in status {status}, expected {expected}")]
    WrongStatus {
        id: Uuid,
        status: String,
        expected: String,
    },

    #[error("Invalid job record: {reason}")]
    InvalidRecord { reason: String },
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Attempt failed: {0}")]
    AttemptFailed(String),

    #[error("Attempt panicked: {0}")]
    AttemptPanicked(String),

    #[error("Engine is shut down")]
    ShutDown,
}

impl JobError {
    /// Wrap an arbitrary failure reported by a runnable's `run`.
    pub fn attempt(reason: impl Into<String>) -> Self {
        Self::AttemptFailed(reason.into())
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
