//! Durable pending-change queue.
//!
//! Every mutation is appended here before it is sent anywhere. Item edits
//! that target an item the server has not seen yet are folded into the
//! pending ADD_ITEM instead of being queued on their own.
//!
//! The sync engine claims a change before sending it. A claimed change is
//! never rewritten, so a fold cannot race with the request carrying the
//! original payload.

use crate::error::{Error, Result, StoreError};
use crate::mapping::IdMap;
use crate::now_ms;
use crate::store::{DurableStore, StoreWrite};
use listsync_engine::{
    find_pending_add, rewrite_pending_add, ActionType, ChangeId, ChangeStatus, EntityId,
    List, NewChange, PendingChange, Rewrite, Timestamp, Version,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// What [`PendingQueue::enqueue_with`] did with a change.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// Appended as a new change
    Queued(PendingChange),
    /// Merged into the pending ADD_ITEM `into`
    Folded { into: ChangeId },
    /// The pending ADD_ITEM `id` lost its last item and was removed
    Removed { id: ChangeId },
}

pub struct PendingQueue {
    store: Arc<dyn DurableStore>,
    ids: Arc<IdMap>,
    notify: Arc<Notify>,
    in_flight: Mutex<HashSet<ChangeId>>,
}

impl PendingQueue {
    pub fn new(store: Arc<dyn DurableStore>, ids: Arc<IdMap>) -> Self {
        Self {
            store,
            ids,
            notify: Arc::new(Notify::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Append a change and wake the sync engine.
    pub async fn enqueue(
        &self,
        action: ActionType,
        entity_id: impl Into<EntityId>,
        payload: Value,
        base_version: Version,
    ) -> Result<EnqueueOutcome> {
        let change = NewChange::new(action, entity_id, payload, now_ms(), base_version);
        self.enqueue_with(change, Vec::new()).await
    }

    /// Append `change` in the same commit as `writes`.
    pub async fn enqueue_with(
        &self,
        change: NewChange,
        writes: Vec<StoreWrite>,
    ) -> Result<EnqueueOutcome> {
        let in_flight = self.in_flight.lock().await;
        let outcome = self.commit_change(&in_flight, change, writes).await?;
        drop(in_flight);
        self.queued(&outcome);
        Ok(outcome)
    }

    /// Read-modify-write of the local copy of `list_id` plus the change
    /// describing it, in one commit.
    ///
    /// `edit` sees the current local copy and returns the change, the store
    /// writes to commit with it, and a value handed back to the caller. No
    /// acknowledgment can land between the read and the commit.
    pub async fn enqueue_edit<T, F>(&self, list_id: &str, edit: F) -> Result<(EnqueueOutcome, T)>
    where
        F: FnOnce(Option<List>) -> Result<(NewChange, Vec<StoreWrite>, T)>,
    {
        let in_flight = self.in_flight.lock().await;
        let local = self.store.get_list(list_id).await?;
        let (change, writes, value) = edit(local)?;
        let outcome = self.commit_change(&in_flight, change, writes).await?;
        drop(in_flight);
        self.queued(&outcome);
        Ok((outcome, value))
    }

    async fn commit_change(
        &self,
        in_flight: &HashSet<ChangeId>,
        change: NewChange,
        mut writes: Vec<StoreWrite>,
    ) -> Result<EnqueueOutcome> {
        let outcome = match self.fold_target(&change, in_flight).await? {
            Some((add, Rewrite::Replace(payload))) => {
                let into = add.id;
                writes.push(StoreWrite::UpdateChange(PendingChange { payload, ..add }));
                self.store.commit(writes).await?;
                EnqueueOutcome::Folded { into }
            }
            Some((add, Rewrite::Remove)) => {
                writes.push(StoreWrite::RemoveChange(add.id));
                self.store.commit(writes).await?;
                EnqueueOutcome::Removed { id: add.id }
            }
            None => {
                writes.push(StoreWrite::AddChange(change));
                let queued = self
                    .store
                    .commit(writes)
                    .await?
                    .pop()
                    .ok_or_else(|| StoreError::Corrupt("append returned no change".into()))?;
                EnqueueOutcome::Queued(queued)
            }
        };
        Ok(outcome)
    }

    fn queued(&self, outcome: &EnqueueOutcome) {
        match outcome {
            EnqueueOutcome::Queued(change) => tracing::debug!(
                change_id = change.id,
                action = %change.action_type.as_str(),
                entity_id = %change.entity_id,
                "Change queued"
            ),
            EnqueueOutcome::Folded { into } => {
                tracing::debug!(into, "Item edit folded into pending add")
            }
            EnqueueOutcome::Removed { id } => {
                tracing::debug!(change_id = id, "Pending add emptied and removed")
            }
        }
        self.notify.notify_one();
    }

    /// The unclaimed pending ADD_ITEM an item edit should fold into, and how.
    async fn fold_target(
        &self,
        change: &NewChange,
        in_flight: &HashSet<ChangeId>,
    ) -> Result<Option<(PendingChange, Rewrite)>> {
        if !matches!(
            change.action_type,
            ActionType::UpdateItem | ActionType::DeleteItem
        ) {
            return Ok(None);
        }
        let Some(item_id) = change.payload.get("itemId").and_then(Value::as_str) else {
            return Ok(None);
        };

        let target = self.ids.resolve(&change.entity_id).await;
        let changes: Vec<PendingChange> = self
            .store
            .list_changes()
            .await?
            .into_iter()
            .filter(|c| !in_flight.contains(&c.id))
            .collect();
        let Some(add) = find_pending_add(
            &changes,
            |id| self.ids.resolve_cached(id) == target,
            item_id,
        ) else {
            return Ok(None);
        };

        let rewrite = rewrite_pending_add(
            add,
            change.action_type,
            &change.payload,
            change.timestamp,
        )?;
        Ok(rewrite.map(|rewrite| (add.clone(), rewrite)))
    }

    /// Take a change for sending. Returns its current stored form, or `None`
    /// when it was folded away or is no longer pending.
    pub async fn claim(&self, id: ChangeId) -> Result<Option<PendingChange>> {
        let mut in_flight = self.in_flight.lock().await;
        match self.store.get_change(id).await? {
            Some(change) if change.is_pending() => {
                in_flight.insert(id);
                Ok(Some(change))
            }
            _ => Ok(None),
        }
    }

    pub async fn release(&self, id: ChangeId) {
        self.in_flight.lock().await.remove(&id);
    }

    /// Remove an acknowledged, claimed change together with the store writes
    /// `build` derives from the local copy of `list_id` and the changes still
    /// outstanding for that list.
    pub async fn acknowledge<T, F>(&self, change_id: ChangeId, list_id: &str, build: F) -> Result<T>
    where
        F: FnOnce(Option<List>, &[PendingChange]) -> (Vec<StoreWrite>, T),
    {
        let mut in_flight = self.in_flight.lock().await;
        let value = self.commit_for_list(list_id, Some(change_id), build).await?;
        in_flight.remove(&change_id);
        Ok(value)
    }

    /// Commit the writes `build` derives from the local copy of `list_id`
    /// and the changes outstanding for it, with no edit or acknowledgment
    /// landing in between.
    pub async fn update_list<T, F>(&self, list_id: &str, build: F) -> Result<T>
    where
        F: FnOnce(Option<List>, &[PendingChange]) -> (Vec<StoreWrite>, T),
    {
        let _in_flight = self.in_flight.lock().await;
        self.commit_for_list(list_id, None, build).await
    }

    async fn commit_for_list<T, F>(
        &self,
        list_id: &str,
        acknowledged: Option<ChangeId>,
        build: F,
    ) -> Result<T>
    where
        F: FnOnce(Option<List>, &[PendingChange]) -> (Vec<StoreWrite>, T),
    {
        let target = self.ids.resolve_cached(list_id);
        let outstanding: Vec<PendingChange> = self
            .store
            .list_changes()
            .await?
            .into_iter()
            .filter(|c| Some(c.id) != acknowledged)
            .filter(|c| self.ids.resolve_cached(&c.entity_id) == target)
            .collect();
        let local = self.store.get_list(list_id).await?;

        let (mut writes, value) = build(local, &outstanding);
        if let Some(id) = acknowledged {
            writes.insert(0, StoreWrite::RemoveChange(id));
        }
        if !writes.is_empty() {
            self.store.commit(writes).await?;
        }
        Ok(value)
    }

    /// Remove an acknowledged change.
    pub async fn dequeue(&self, id: ChangeId) -> Result<()> {
        self.store.remove_change(id).await?;
        Ok(())
    }

    /// Pending changes ordered by (timestamp, id).
    pub async fn list_pending(&self) -> Result<Vec<PendingChange>> {
        Ok(self
            .store
            .list_changes()
            .await?
            .into_iter()
            .filter(PendingChange::is_pending)
            .collect())
    }

    /// Pending and failed changes.
    pub async fn all_changes(&self) -> Result<Vec<PendingChange>> {
        Ok(self.store.list_changes().await?)
    }

    /// Sweep id mappings while nothing can be queued, so no change lands
    /// on a mapping between the sweep reading the queue and removing it.
    pub async fn sweep_mappings(&self, now: Timestamp) -> Result<usize> {
        let _in_flight = self.in_flight.lock().await;
        Ok(self.ids.sweep(now).await?)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.list_pending().await?.len())
    }

    pub async fn failed(&self) -> Result<Vec<PendingChange>> {
        Ok(self
            .store
            .list_changes()
            .await?
            .into_iter()
            .filter(|c| c.status == ChangeStatus::Failed)
            .collect())
    }

    /// Mark changes failed in one commit, reading each one's current stored
    /// form first. Returns the changes that were marked.
    pub async fn mark_failed(&self, ids: &[ChangeId]) -> Result<Vec<PendingChange>> {
        let mut in_flight = self.in_flight.lock().await;
        let mut failed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(change) = self.store.get_change(*id).await? {
                failed.push(PendingChange {
                    status: ChangeStatus::Failed,
                    ..change
                });
            }
        }
        let writes = failed.iter().cloned().map(StoreWrite::UpdateChange).collect();
        self.store.commit(writes).await?;
        for id in ids {
            in_flight.remove(id);
        }
        Ok(failed)
    }

    /// Count one more transient failure on a claimed change. Returns the new
    /// retry count.
    pub async fn bump_retry(&self, change: &PendingChange) -> Result<u32> {
        let retries = change.retries + 1;
        self.store
            .update_change(&PendingChange {
                retries,
                ..change.clone()
            })
            .await?;
        Ok(retries)
    }

    /// Put a failed change back in the queue with a fresh retry count.
    pub async fn retry_failed(&self, id: ChangeId) -> Result<PendingChange> {
        let change = self.failed_change(id).await?;
        let change = PendingChange {
            status: ChangeStatus::Pending,
            retries: 0,
            ..change
        };
        self.store.update_change(&change).await?;
        tracing::info!(change_id = id, entity_id = %change.entity_id, "Failed change requeued");
        self.notify.notify_one();
        Ok(change)
    }

    /// Drop a failed change for good. The only way a change leaves the log
    /// without being acknowledged.
    pub async fn discard_failed(&self, id: ChangeId) -> Result<PendingChange> {
        let change = self.failed_change(id).await?;
        self.store.remove_change(id).await?;
        tracing::info!(change_id = id, entity_id = %change.entity_id, "Failed change discarded");
        self.notify.notify_one();
        Ok(change)
    }

    /// Wakes whenever a change is queued or requeued.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    async fn failed_change(&self, id: ChangeId) -> Result<PendingChange> {
        match self.store.get_change(id).await? {
            Some(change) if change.status == ChangeStatus::Failed => Ok(change),
            Some(_) => Err(Error::BadRequest(format!("change {id} has not failed"))),
            None => Err(Error::NotFound(format!("change {id}"))),
        }
    }
}

impl std::fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use listsync_engine::Item;
    use serde_json::json;
    use std::time::Duration;

    fn queue() -> (Arc<MemoryStore>, PendingQueue) {
        let store = Arc::new(MemoryStore::new());
        let ids = Arc::new(IdMap::new(store.clone(), Duration::from_secs(60)));
        (store.clone(), PendingQueue::new(store, ids))
    }

    fn add_items(ids: &[&str]) -> Value {
        let items: Vec<Item> = ids
            .iter()
            .enumerate()
            .map(|(pos, id)| Item::new(*id, format!("text {id}"), pos as i64, 1))
            .collect();
        json!({ "items": items })
    }

    #[tokio::test]
    async fn enqueue_appends_in_order() {
        let (_, queue) = queue();
        queue
            .enqueue(ActionType::CreateList, "temp-1", json!({"id": "temp-1", "title": "a"}), 0)
            .await
            .unwrap();
        queue
            .enqueue(ActionType::UpdateList, "temp-1", json!({"title": "b"}), 0)
            .await
            .unwrap();

        let pending = queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].id < pending[1].id);
        assert_eq!(queue.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn item_update_folds_into_pending_add() {
        let (_, queue) = queue();
        let EnqueueOutcome::Queued(add) = queue
            .enqueue(ActionType::AddItem, "temp-1", add_items(&["i1", "i2"]), 0)
            .await
            .unwrap()
        else {
            panic!("expected a queued change");
        };

        let outcome = queue
            .enqueue(
                ActionType::UpdateItem,
                "temp-1",
                json!({"itemId": "i1", "changes": {"text": "oat milk"}}),
                0,
            )
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Folded { into: add.id });

        let pending = queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["items"][0]["text"], "oat milk");
    }

    #[tokio::test]
    async fn deleting_last_pending_item_removes_the_add() {
        let (_, queue) = queue();
        let EnqueueOutcome::Queued(add) = queue
            .enqueue(ActionType::AddItem, "temp-1", add_items(&["i1"]), 0)
            .await
            .unwrap()
        else {
            panic!("expected a queued change");
        };

        let outcome = queue
            .enqueue(ActionType::DeleteItem, "temp-1", json!({"itemId": "i1"}), 0)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Removed { id: add.id });
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claimed_add_is_not_rewritten() {
        let (_, queue) = queue();
        let EnqueueOutcome::Queued(add) = queue
            .enqueue(ActionType::AddItem, "srv-1", add_items(&["i1"]), 3)
            .await
            .unwrap()
        else {
            panic!("expected a queued change");
        };
        assert!(queue.claim(add.id).await.unwrap().is_some());

        let outcome = queue
            .enqueue(ActionType::DeleteItem, "srv-1", json!({"itemId": "i1"}), 3)
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Queued(ref c) if c.action_type == ActionType::DeleteItem));

        queue.release(add.id).await;
        assert_eq!(queue.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_changes_need_explicit_action() {
        let (store, queue) = queue();
        let EnqueueOutcome::Queued(change) = queue
            .enqueue(ActionType::UpdateList, "srv-1", json!({"title": "x"}), 1)
            .await
            .unwrap()
        else {
            panic!("expected a queued change");
        };

        assert!(matches!(
            queue.discard_failed(change.id).await,
            Err(Error::BadRequest(_))
        ));

        queue.mark_failed(&[change.id]).await.unwrap();
        assert!(queue.list_pending().await.unwrap().is_empty());
        assert_eq!(queue.failed().await.unwrap().len(), 1);

        let requeued = queue.retry_failed(change.id).await.unwrap();
        assert_eq!(requeued.status, ChangeStatus::Pending);
        assert_eq!(requeued.retries, 0);

        queue.mark_failed(&[requeued.id]).await.unwrap();
        queue.discard_failed(change.id).await.unwrap();
        assert!(store.list_changes().await.unwrap().is_empty());
        assert!(matches!(
            queue.retry_failed(change.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn edit_and_acknowledge_see_consistent_state() {
        let (store, queue) = queue();
        store.put_list(&List::new("srv-1", "Groceries", "me", 1)).await.unwrap();

        let (outcome, title) = queue
            .enqueue_edit("srv-1", |local| {
                let mut list = local.ok_or_else(|| Error::NotFound("srv-1".into()))?;
                list.title = "Weekly".into();
                list.local_revision += 1;
                let change = NewChange::new(ActionType::UpdateList, "srv-1", json!({"title": "Weekly"}), 2, 0);
                let title = list.title.clone();
                Ok((change, vec![StoreWrite::PutList(list)], title))
            })
            .await
            .unwrap();
        assert_eq!(title, "Weekly");
        let EnqueueOutcome::Queued(first) = outcome else {
            panic!("expected a queued change");
        };
        let EnqueueOutcome::Queued(second) = queue
            .enqueue(ActionType::DeleteItem, "srv-1", json!({"itemId": "i9"}), 0)
            .await
            .unwrap()
        else {
            panic!("expected a queued change");
        };

        queue.claim(first.id).await.unwrap().unwrap();
        let seen = queue
            .acknowledge(first.id, "srv-1", |local, outstanding| {
                assert_eq!(local.unwrap().title, "Weekly");
                (Vec::new(), outstanding.iter().map(|c| c.id).collect::<Vec<_>>())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![second.id]);

        queue.dequeue(second.id).await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }
}
