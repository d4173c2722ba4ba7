//! Error types for the listsync engine.

use crate::{EntityId, ItemId};
use thiserror::Error;

/// All possible errors from the listsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    #[error("invalid payload for {action}: {reason}")]
    InvalidPayload { action: String, reason: String },

    #[error("item {item_id} not found in list {list_id}")]
    ItemNotFound { list_id: EntityId, item_id: ItemId },

    #[error("unknown action type: {0}")]
    UnknownAction(String),

    // Resolution errors
    #[error("conflict resolution failed: {0}")]
    ResolutionFailed(String),
}

impl Error {
    pub(crate) fn invalid_payload(action: impl ToString, reason: impl ToString) -> Self {
        Error::InvalidPayload {
            action: action.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
