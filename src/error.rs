//! Error types for the automation engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Message delivery errors, classified from platform responses.
///
/// `ExpiredWindow` and `CredentialMissing` are terminal for the send;
/// `RateLimited` is the only retryable variant.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The platform's post-inbound delivery window has elapsed.
    /// Never retried; the attempted message is persisted as failed.
    #[error("Delivery window expired for recipient {recipient}: {message}")]
    ExpiredWindow { recipient: String, message: String },

    /// Platform rate limit hit. Caller may retry after `retry_after`.
    #[error("Rate limited by platform, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// No access token available for the account. Fatal for the send.
    #[error("No access token for account {account_id}")]
    CredentialMissing { account_id: Uuid },

    /// Any other transport/API failure. Logged, not retried.
    #[error("Transport error (code {code:?}): {message}")]
    Transport { code: Option<i64>, message: String },
}

impl DeliveryError {
    /// Whether the caller may retry the send.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::RateLimited { .. })
    }

    /// Short reason code persisted with failed messages.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DeliveryError::ExpiredWindow { .. } => "24h_window",
            DeliveryError::RateLimited { .. } => "rate_limit",
            DeliveryError::CredentialMissing { .. } => "no_credentials",
            DeliveryError::Transport { .. } => "transport",
        }
    }
}

/// Flow definition and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Flow has no nodes")]
    EmptyFlow,

    #[error("Flow has no trigger node")]
    MissingTrigger,

    #[error("Node {node_id} referenced by an edge does not exist")]
    MissingNode { node_id: String },

    #[error("Node {node_id} has invalid data for type {node_type}: {message}")]
    InvalidNodeData {
        node_id: String,
        node_type: String,
        message: String,
    },

    #[error("Conversation {conversation_id} is not waiting for input")]
    NotWaiting { conversation_id: Uuid },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
