//! Grouping, replay ordering and in-place rewriting of pending changes.
//!
//! # Algorithm
//!
//! 1. Key every change by its resolved entity id (a temp id and its real id
//!    land in the same group)
//! 2. Drop groups holding a failed change; they stay halted until the
//!    failure is cleared
//! 3. Sort each group by (action priority, timestamp, sequence number)
//! 4. Order groups by their oldest change

use crate::{
    change::{AddItemsPayload, DeleteItemPayload, UpdateItemPayload},
    error::Result,
    ActionType, ChangeStatus, EntityId, Error, PendingChange, Timestamp,
};
use serde_json::Value;
use std::collections::HashMap;

/// All replayable changes for one entity, in replay order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeGroup {
    /// Best known id for the entity
    pub entity_id: EntityId,
    pub changes: Vec<PendingChange>,
}

impl ChangeGroup {
    /// Split the group into consecutive batches of at most `size` changes.
    pub fn batches(&self, size: usize) -> std::slice::Chunks<'_, PendingChange> {
        self.changes.chunks(size.max(1))
    }

    fn oldest(&self) -> (Timestamp, u64) {
        self.changes
            .iter()
            .map(|c| (c.timestamp, c.id))
            .min()
            .unwrap_or((Timestamp::MAX, u64::MAX))
    }
}

/// Group changes by entity and sort each group into replay order.
///
/// `resolve` maps an entity id to the best known id for it.
pub fn group_changes<F>(changes: Vec<PendingChange>, resolve: F) -> Vec<ChangeGroup>
where
    F: Fn(&str) -> EntityId,
{
    let mut by_entity: HashMap<EntityId, Vec<PendingChange>> = HashMap::new();
    for change in changes {
        by_entity
            .entry(resolve(&change.entity_id))
            .or_default()
            .push(change);
    }

    let mut groups: Vec<ChangeGroup> = by_entity
        .into_iter()
        .filter(|(_, changes)| changes.iter().all(|c| c.status == ChangeStatus::Pending))
        .map(|(entity_id, mut changes)| {
            changes.sort_by_key(PendingChange::replay_key);
            ChangeGroup { entity_id, changes }
        })
        .collect();

    groups.sort_by(|a, b| {
        a.oldest()
            .cmp(&b.oldest())
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    groups
}

/// Find the pending ADD_ITEM change that still carries `item_id`.
///
/// `matches_entity` decides whether a change's entity id refers to the list
/// in question.
pub fn find_pending_add<'a, F>(
    changes: &'a [PendingChange],
    matches_entity: F,
    item_id: &str,
) -> Option<&'a PendingChange>
where
    F: Fn(&str) -> bool,
{
    changes.iter().find(|change| {
        change.is_pending()
            && change.action_type == ActionType::AddItem
            && matches_entity(&change.entity_id)
            && change
                .decode::<AddItemsPayload>()
                .map(|payload| payload.items.iter().any(|item| item.id == item_id))
                .unwrap_or(false)
    })
}

/// Outcome of folding an item sub-operation into a pending ADD_ITEM.
#[derive(Debug, Clone, PartialEq)]
pub enum Rewrite {
    /// Store this payload on the ADD_ITEM change
    Replace(Value),
    /// The ADD_ITEM change has no items left; remove it
    Remove,
}

/// Fold an UPDATE_ITEM or DELETE_ITEM into a pending ADD_ITEM change.
///
/// Returns `Ok(None)` for actions that are never folded.
pub fn rewrite_pending_add(
    add: &PendingChange,
    action: ActionType,
    payload: &Value,
    timestamp: Timestamp,
) -> Result<Option<Rewrite>> {
    if add.action_type != ActionType::AddItem {
        return Err(Error::invalid_payload(
            add.action_type,
            "only ADD_ITEM changes can be rewritten",
        ));
    }
    let mut pending: AddItemsPayload = add.decode()?;

    let rewrite = match action {
        ActionType::UpdateItem => {
            let update: UpdateItemPayload = serde_json::from_value(payload.clone())
                .map_err(|e| Error::invalid_payload(action, e))?;
            let item = pending
                .items
                .iter_mut()
                .find(|item| item.id == update.item_id)
                .ok_or_else(|| Error::ItemNotFound {
                    list_id: add.entity_id.clone(),
                    item_id: update.item_id.clone(),
                })?;
            item.apply_changes(&update.changes, timestamp)?;
            Rewrite::Replace(to_value(&pending)?)
        }
        ActionType::DeleteItem => {
            let delete: DeleteItemPayload = serde_json::from_value(payload.clone())
                .map_err(|e| Error::invalid_payload(action, e))?;
            let before = pending.items.len();
            pending.items.retain(|item| item.id != delete.item_id);
            if pending.items.len() == before {
                return Err(Error::ItemNotFound {
                    list_id: add.entity_id.clone(),
                    item_id: delete.item_id,
                });
            }
            if pending.items.is_empty() {
                Rewrite::Remove
            } else {
                Rewrite::Replace(to_value(&pending)?)
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(rewrite))
}

fn to_value(payload: &AddItemsPayload) -> Result<Value> {
    serde_json::to_value(payload).map_err(|e| Error::invalid_payload(ActionType::AddItem, e))
}
