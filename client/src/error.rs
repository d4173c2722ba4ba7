//! Error types for the sync runtime.

use crate::{api::ApiError, auth::AuthError, config::ConfigError};

/// Durable store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<listsync_engine::Error> for StoreError {
    fn from(err: listsync_engine::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Realtime transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Realtime endpoint rejected the token")]
    Unauthorized,

    #[error("Realtime endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Session closed")]
    Closed,
}

/// Top-level error for client operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Engine error: {0}")]
    Engine(#[from] listsync_engine::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;
