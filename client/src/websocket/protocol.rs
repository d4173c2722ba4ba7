//! Realtime message protocol definitions.
//!
//! All messages are JSON-encoded and use snake_case for field names.

use listsync_engine::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to updates for one list.
    Join { topic: EntityId },

    /// Drop a subscription.
    Leave { topic: EntityId },

    /// Health-check ping; the server answers with `pong`.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Response to ping.
    Pong,

    /// Another client changed an entity in a subscribed topic.
    EntityUpdated {
        entity_type: String,
        entity_id: EntityId,
        /// The entity after the change; `null` when it was deleted
        #[serde(default)]
        payload: Value,
    },

    /// Error message.
    Error { message: String },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}
