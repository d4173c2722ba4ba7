//! Lists, items and shares: the synchronized data model.

use crate::{error::Result, EntityId, Error, ItemId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Prefix carried by every locally generated list id.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Build a temporary id from a caller-supplied unique token.
pub fn new_temp_id(token: impl std::fmt::Display) -> EntityId {
    format!("{TEMP_ID_PREFIX}{token}")
}

/// Whether an id was generated locally and has not been confirmed by the server.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Access level granted to a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    Read,
    Write,
    Admin,
}

/// A collaborator a list is shared with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub user_ref: String,
    pub permission: Permission,
}

/// An entry in a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Unique within the owning list
    pub id: ItemId,
    pub text: String,
    #[serde(default)]
    pub completed: bool,
    /// Render order, ascending
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub updated_at: Timestamp,
}

impl Item {
    /// Create a new, uncompleted item.
    pub fn new(
        id: impl Into<ItemId>,
        text: impl Into<String>,
        position: i64,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            completed: false,
            position,
            updated_at: timestamp,
        }
    }

    /// Merge a partial field map into this item.
    ///
    /// Only `text`, `completed` and `position` are editable; `id` is ignored.
    pub fn apply_changes(&mut self, changes: &Map<String, Value>, timestamp: Timestamp) -> Result<()> {
        for (field, value) in changes {
            match field.as_str() {
                "text" => {
                    self.text = value
                        .as_str()
                        .ok_or_else(|| Error::invalid_payload("UPDATE_ITEM", "text must be a string"))?
                        .to_string();
                }
                "completed" => {
                    self.completed = value.as_bool().ok_or_else(|| {
                        Error::invalid_payload("UPDATE_ITEM", "completed must be a boolean")
                    })?;
                }
                "position" => {
                    self.position = value.as_i64().ok_or_else(|| {
                        Error::invalid_payload("UPDATE_ITEM", "position must be an integer")
                    })?;
                }
                _ => {}
            }
        }
        self.updated_at = timestamp;
        Ok(())
    }
}

/// A collaborative list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
    /// Server id, or a temp id before the first successful create
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub shared_with: Vec<Share>,
    /// Assigned by the server; 0 for lists the server has never seen
    #[serde(default)]
    pub version: Version,
    #[serde(default)]
    pub updated_at: Timestamp,
    /// Local edits not yet acknowledged by the server
    #[serde(default)]
    pub local_revision: u64,
}

impl List {
    /// Create a new list. Call sites creating offline pass a temp id.
    pub fn new(
        id: impl Into<EntityId>,
        title: impl Into<String>,
        owner: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            items: Vec::new(),
            owner: owner.into(),
            shared_with: Vec::new(),
            version: 0,
            updated_at: timestamp,
            local_revision: 0,
        }
    }

    /// Parse a list from an untyped JSON value, checking its structure first.
    ///
    /// The value must be an object with a non-empty string `id`, an `items`
    /// array (if present) and a numeric `version` (if present).
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::InvalidEntity("expected an object".into()))?;

        match object.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => {}
            _ => return Err(Error::InvalidEntity("id must be a non-empty string".into())),
        }
        if let Some(items) = object.get("items") {
            if !items.is_array() {
                return Err(Error::InvalidEntity("items must be a sequence".into()));
            }
        }
        if let Some(version) = object.get("version") {
            if !version.is_u64() {
                return Err(Error::InvalidEntity("version must be a number".into()));
            }
        }

        let list: List = serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidEntity(e.to_string()))?;
        list.validate()?;
        Ok(list)
    }

    /// Structural validation: non-empty id and unique, non-empty item ids.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidEntity("id must not be empty".into()));
        }
        let mut seen = HashSet::with_capacity(self.items.len());
        for item in &self.items {
            if item.id.is_empty() {
                return Err(Error::InvalidEntity(format!(
                    "list {} has an item with an empty id",
                    self.id
                )));
            }
            if !seen.insert(item.id.as_str()) {
                return Err(Error::InvalidEntity(format!(
                    "list {} has duplicate item id {}",
                    self.id, item.id
                )));
            }
        }
        Ok(())
    }

    /// Check if this list has never been confirmed by the server.
    pub fn is_temp(&self) -> bool {
        is_temp_id(&self.id)
    }

    /// Get an item by id.
    pub fn item(&self, item_id: &str) -> Option<&Item> {
        self.items.iter().find(|item| item.id == item_id)
    }

    /// Record a local edit.
    pub fn touch_local(&mut self, timestamp: Timestamp) {
        self.local_revision += 1;
        self.updated_at = timestamp;
    }

    /// Apply a list-level patch (`title`, `items`, `sharedWith`).
    pub fn apply_patch(&mut self, patch: &Map<String, Value>, timestamp: Timestamp) -> Result<()> {
        for (field, value) in patch {
            match field.as_str() {
                "title" => {
                    self.title = value
                        .as_str()
                        .ok_or_else(|| Error::invalid_payload("UPDATE_LIST", "title must be a string"))?
                        .to_string();
                }
                "items" => {
                    self.items = serde_json::from_value(value.clone())
                        .map_err(|e| Error::invalid_payload("UPDATE_LIST", e))?;
                }
                "sharedWith" => {
                    self.shared_with = serde_json::from_value(value.clone())
                        .map_err(|e| Error::invalid_payload("UPDATE_LIST", e))?;
                }
                _ => {}
            }
        }
        self.updated_at = timestamp;
        self.validate()
    }

    /// Append items, replacing any existing item with the same id.
    pub fn add_items(&mut self, items: &[Item], timestamp: Timestamp) {
        for item in items {
            match self.items.iter_mut().find(|existing| existing.id == item.id) {
                Some(existing) => *existing = item.clone(),
                None => self.items.push(item.clone()),
            }
        }
        self.updated_at = timestamp;
    }

    /// Merge field changes into one item.
    pub fn update_item(
        &mut self,
        item_id: &str,
        changes: &Map<String, Value>,
        timestamp: Timestamp,
    ) -> Result<()> {
        let list_id = self.id.clone();
        let item = self
            .items
            .iter_mut()
            .find(|item| item.id == item_id)
            .ok_or_else(|| Error::ItemNotFound {
                list_id,
                item_id: item_id.to_string(),
            })?;
        item.apply_changes(changes, timestamp)?;
        self.updated_at = timestamp;
        Ok(())
    }

    /// Remove one item.
    pub fn remove_item(&mut self, item_id: &str, timestamp: Timestamp) -> Result<()> {
        let before = self.items.len();
        self.items.retain(|item| item.id != item_id);
        if self.items.len() == before {
            return Err(Error::ItemNotFound {
                list_id: self.id.clone(),
                item_id: item_id.to_string(),
            });
        }
        self.updated_at = timestamp;
        Ok(())
    }

    /// Reassign positions so the given ids come first, in that order.
    ///
    /// Items not named keep their relative order after the named ones.
    /// Unknown ids are skipped.
    pub fn reorder_items(&mut self, ordered_ids: &[ItemId], timestamp: Timestamp) {
        let mut ordered: Vec<Item> = Vec::with_capacity(self.items.len());
        for id in ordered_ids {
            if let Some(index) = self.items.iter().position(|item| &item.id == id) {
                ordered.push(self.items.remove(index));
            }
        }
        self.items.sort_by_key(|item| item.position);
        ordered.append(&mut self.items);

        for (position, item) in ordered.iter_mut().enumerate() {
            let position = position as i64;
            if item.position != position {
                item.position = position;
                item.updated_at = timestamp;
            }
        }
        self.items = ordered;
        self.updated_at = timestamp;
    }

    /// Grant access, replacing any existing share for the same user.
    pub fn share(&mut self, share: Share, timestamp: Timestamp) {
        self.shared_with.retain(|existing| existing.user_ref != share.user_ref);
        self.shared_with.push(share);
        self.updated_at = timestamp;
    }

    /// Revoke access for one user.
    pub fn unshare(&mut self, user_ref: &str, timestamp: Timestamp) {
        self.shared_with.retain(|existing| existing.user_ref != user_ref);
        self.updated_at = timestamp;
    }
}
