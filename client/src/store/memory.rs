//! In-memory durable store, for tests and ephemeral sessions.

use super::{DurableStore, StoreResult, StoreWrite};
use crate::error::StoreError;
use async_trait::async_trait;
use listsync_engine::{
    ChangeId, ConflictRecord, EntityId, IdMapping, List, MappingStatus, PendingChange, Timestamp,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default)]
struct Tables {
    lists: BTreeMap<EntityId, List>,
    changes: BTreeMap<ChangeId, PendingChange>,
    next_change: ChangeId,
    /// Keyed by temp id
    mappings: HashMap<EntityId, IdMapping>,
    conflicts: Vec<ConflictRecord>,
}

impl Tables {
    fn apply(&mut self, write: StoreWrite, added: &mut Vec<PendingChange>) {
        match write {
            StoreWrite::PutList(list) => {
                self.lists.insert(list.id.clone(), list);
            }
            StoreWrite::DeleteList(id) => {
                self.lists.remove(&id);
            }
            StoreWrite::AddChange(change) => {
                self.next_change += 1;
                let change = change.into_pending(self.next_change);
                self.changes.insert(change.id, change.clone());
                added.push(change);
            }
            StoreWrite::UpdateChange(change) => {
                if let Some(existing) = self.changes.get_mut(&change.id) {
                    *existing = change;
                }
            }
            StoreWrite::RemoveChange(id) => {
                self.changes.remove(&id);
            }
            StoreWrite::SaveMapping(mapping) => {
                self.mappings.insert(mapping.temp_id.clone(), mapping);
            }
        }
    }
}

/// A [`DurableStore`] backed by plain collections behind an async mutex.
///
/// Commits apply to a copy of the tables and swap it in, so a batch is all
/// or nothing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get_list(&self, id: &str) -> StoreResult<Option<List>> {
        self.check()?;
        Ok(self.tables.lock().await.lists.get(id).cloned())
    }

    async fn all_lists(&self) -> StoreResult<Vec<List>> {
        self.check()?;
        Ok(self.tables.lock().await.lists.values().cloned().collect())
    }

    async fn list_changes(&self) -> StoreResult<Vec<PendingChange>> {
        self.check()?;
        let mut changes: Vec<_> = self.tables.lock().await.changes.values().cloned().collect();
        changes.sort_by_key(|c| (c.timestamp, c.id));
        Ok(changes)
    }

    async fn get_change(&self, id: ChangeId) -> StoreResult<Option<PendingChange>> {
        self.check()?;
        Ok(self.tables.lock().await.changes.get(&id).cloned())
    }

    async fn get_mapping(&self, id: &str) -> StoreResult<Option<IdMapping>> {
        self.check()?;
        let tables = self.tables.lock().await;
        if let Some(mapping) = tables.mappings.get(id) {
            return Ok(Some(mapping.clone()));
        }
        Ok(tables.mappings.values().find(|m| m.actual_id == id).cloned())
    }

    async fn all_mappings(&self) -> StoreResult<Vec<IdMapping>> {
        self.check()?;
        let mut mappings: Vec<_> = self.tables.lock().await.mappings.values().cloned().collect();
        mappings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.temp_id.cmp(&b.temp_id)));
        Ok(mappings)
    }

    async fn update_mapping_status(
        &self,
        temp_id: &str,
        status: MappingStatus,
    ) -> StoreResult<()> {
        self.check()?;
        if let Some(mapping) = self.tables.lock().await.mappings.get_mut(temp_id) {
            mapping.status = status;
        }
        Ok(())
    }

    async fn remove_mapping(&self, temp_id: &str) -> StoreResult<()> {
        self.check()?;
        self.tables.lock().await.mappings.remove(temp_id);
        Ok(())
    }

    async fn append_conflicts(&self, records: &[ConflictRecord]) -> StoreResult<()> {
        self.check()?;
        self.tables
            .lock()
            .await
            .conflicts
            .extend_from_slice(records);
        Ok(())
    }

    async fn list_conflicts(&self) -> StoreResult<Vec<ConflictRecord>> {
        self.check()?;
        Ok(self.tables.lock().await.conflicts.clone())
    }

    async fn delete_conflicts_before(&self, cutoff: Timestamp) -> StoreResult<u64> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let before = tables.conflicts.len();
        tables.conflicts.retain(|record| record.timestamp >= cutoff);
        Ok((before - tables.conflicts.len()) as u64)
    }

    async fn commit(&self, writes: Vec<StoreWrite>) -> StoreResult<Vec<PendingChange>> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let mut staged = tables.clone();
        let mut added = Vec::new();
        for write in writes {
            staged.apply(write, &mut added);
        }
        *tables = staged;
        Ok(added)
    }
}
