//! Error types for the relay.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by an SMS channel when a transmission is issued.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} rejected transmission: {reason}")]
    Rejected { name: String, reason: String },

    #[error("Channel {name} unreachable: {reason}")]
    Unreachable { name: String, reason: String },

    #[error("Channel {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// Errors raised by the dispatch loop.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Task source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Malformed job {id}: missing {field}")]
    MalformedJob { id: String, field: &'static str },

    #[error("Transmission of job {job_id} rejected: {reason}")]
    TransmitRejected { job_id: String, reason: String },

    #[error("No signed-in session; dispatch refused")]
    NotAuthenticated,

    #[error("Dispatch cycle panicked: {0}")]
    LoopPanicked(String),
}

/// Denial reasons surfaced by the device-binding guard.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Account identifier and credential are required")]
    MissingCredentials,

    #[error("This device is already bound to another account")]
    DeviceAlreadyBound,

    #[error("Account {0} is already registered")]
    AccountExists(String),

    #[error("Account {0} not found")]
    AccountNotFound(String),

    #[error("Incorrect credential")]
    InvalidCredential,

    #[error("Account is bound to another device")]
    DeviceMismatch,

    #[error("Account store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Errors raised while correlating completion signals.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Completion signal is missing correlation field {0}")]
    MissingCorrelation(&'static str),

    #[error("Job {0} was never issued by this relay")]
    NotIssued(String),

    #[error("Job {job_id} was issued for account {issued_to}, not {claimed}")]
    AccountMismatch {
        job_id: String,
        issued_to: String,
        claimed: String,
    },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
