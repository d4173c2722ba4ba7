//! Pending change types.
//!
//! Every mutation a user makes is recorded as a [`PendingChange`] and kept
//! until the server acknowledges it. Payloads are JSON; the typed payload
//! structs in this module describe their shape per [`ActionType`].

use crate::{error::Result, ChangeId, EntityId, Error, Item, ItemId, Permission, Timestamp, Version};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// The kind of mutation a change carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    CreateList,
    UpdateList,
    DeleteList,
    ShareList,
    UnshareList,
    AddItem,
    UpdateItem,
    DeleteItem,
    ReorderItem,
}

impl ActionType {
    pub const ALL: [ActionType; 9] = [
        ActionType::CreateList,
        ActionType::UpdateList,
        ActionType::DeleteList,
        ActionType::ShareList,
        ActionType::UnshareList,
        ActionType::AddItem,
        ActionType::UpdateItem,
        ActionType::DeleteItem,
        ActionType::ReorderItem,
    ];

    /// Replay priority within an entity group. Lower runs first.
    ///
    /// List-level changes precede item-level changes; share and unshare
    /// share a slot so their relative order comes from timestamps.
    pub fn priority(self) -> u8 {
        match self {
            ActionType::CreateList => 0,
            ActionType::UpdateList => 1,
            ActionType::DeleteList => 2,
            ActionType::ShareList | ActionType::UnshareList => 3,
            ActionType::AddItem => 4,
            ActionType::UpdateItem => 5,
            ActionType::DeleteItem => 6,
            ActionType::ReorderItem => 7,
        }
    }

    pub fn is_item_level(self) -> bool {
        self.priority() >= ActionType::AddItem.priority()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::CreateList => "CREATE_LIST",
            ActionType::UpdateList => "UPDATE_LIST",
            ActionType::DeleteList => "DELETE_LIST",
            ActionType::ShareList => "SHARE_LIST",
            ActionType::UnshareList => "UNSHARE_LIST",
            ActionType::AddItem => "ADD_ITEM",
            ActionType::UpdateItem => "UPDATE_ITEM",
            ActionType::DeleteItem => "DELETE_ITEM",
            ActionType::ReorderItem => "REORDER_ITEM",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ActionType::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| Error::UnknownAction(s.to_string()))
    }
}

/// Lifecycle status of a pending change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    #[default]
    Pending,
    /// Retries exhausted or a non-retryable error; waits for an explicit user action
    Failed,
}

impl ChangeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Failed => "failed",
        }
    }
}

impl FromStr for ChangeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ChangeStatus::Pending),
            "failed" => Ok(ChangeStatus::Failed),
            other => Err(Error::invalid_payload("status", format!("unknown status {other}"))),
        }
    }
}

/// A change that has not been recorded yet (no sequence number).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChange {
    pub action_type: ActionType,
    pub entity_id: EntityId,
    pub payload: Value,
    pub timestamp: Timestamp,
    pub base_version: Version,
}

impl NewChange {
    pub fn new(
        action_type: ActionType,
        entity_id: impl Into<EntityId>,
        payload: Value,
        timestamp: Timestamp,
        base_version: Version,
    ) -> Self {
        Self {
            action_type,
            entity_id: entity_id.into(),
            payload,
            timestamp,
            base_version,
        }
    }

    /// Assign the local sequence number.
    pub fn into_pending(self, id: ChangeId) -> PendingChange {
        PendingChange {
            id,
            action_type: self.action_type,
            entity_id: self.entity_id,
            payload: self.payload,
            timestamp: self.timestamp,
            retries: 0,
            status: ChangeStatus::Pending,
            base_version: self.base_version,
        }
    }
}

/// A mutation waiting for server acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    /// Local sequence number
    pub id: ChangeId,
    pub action_type: ActionType,
    pub entity_id: EntityId,
    pub payload: Value,
    pub timestamp: Timestamp,
    pub retries: u32,
    pub status: ChangeStatus,
    /// Entity version the change was computed against
    pub base_version: Version,
}

impl PendingChange {
    /// Create a pending change with zero retries.
    pub fn new(
        id: ChangeId,
        action_type: ActionType,
        entity_id: impl Into<EntityId>,
        payload: Value,
        timestamp: Timestamp,
        base_version: Version,
    ) -> Self {
        NewChange::new(action_type, entity_id, payload, timestamp, base_version).into_pending(id)
    }

    pub fn is_pending(&self) -> bool {
        self.status == ChangeStatus::Pending
    }

    /// Sort key used when replaying an entity group.
    pub fn replay_key(&self) -> (u8, Timestamp, ChangeId) {
        (self.action_type.priority(), self.timestamp, self.id)
    }

    /// Decode the payload into its typed form.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::invalid_payload(self.action_type, e))
    }

    /// Decode an UPDATE_LIST payload as a field map.
    pub fn patch(&self) -> Result<&Map<String, Value>> {
        self.payload
            .as_object()
            .ok_or_else(|| Error::invalid_payload(self.action_type, "expected an object"))
    }
}

/// Payload of ADD_ITEM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddItemsPayload {
    pub items: Vec<Item>,
}

/// Payload of UPDATE_ITEM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateItemPayload {
    pub item_id: ItemId,
    pub changes: Map<String, Value>,
}

/// Payload of DELETE_ITEM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteItemPayload {
    pub item_id: ItemId,
}

/// Payload of REORDER_ITEM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderItemsPayload {
    pub item_ids: Vec<ItemId>,
}

/// Payload of SHARE_LIST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharePayload {
    pub user_ref: String,
    pub permission: Permission,
}

/// Payload of UNSHARE_LIST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsharePayload {
    pub user_ref: String,
}
