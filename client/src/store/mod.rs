//! Durable store capability.
//!
//! The store is the single source of truth: every in-memory cache (the id
//! map) reconciles against it. Writes that must land together go through
//! [`DurableStore::commit`], which applies a batch of [`StoreWrite`]s in one
//! transaction.

mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;
use async_trait::async_trait;
use listsync_engine::{
    ChangeId, ConflictRecord, EntityId, IdMapping, List, MappingStatus, NewChange, PendingChange,
    Timestamp,
};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One write inside an atomic commit.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    PutList(List),
    DeleteList(EntityId),
    /// Append to the pending-change log; the store assigns the sequence number
    AddChange(NewChange),
    UpdateChange(PendingChange),
    RemoveChange(ChangeId),
    SaveMapping(IdMapping),
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_list(&self, id: &str) -> StoreResult<Option<List>>;

    async fn all_lists(&self) -> StoreResult<Vec<List>>;

    /// Every change in the log, pending and failed, ordered by (timestamp, id).
    async fn list_changes(&self) -> StoreResult<Vec<PendingChange>>;

    async fn get_change(&self, id: ChangeId) -> StoreResult<Option<PendingChange>>;

    /// Look a mapping up by either its temp id or its actual id.
    async fn get_mapping(&self, id: &str) -> StoreResult<Option<IdMapping>>;

    async fn all_mappings(&self) -> StoreResult<Vec<IdMapping>>;

    async fn update_mapping_status(&self, temp_id: &str, status: MappingStatus)
        -> StoreResult<()>;

    async fn remove_mapping(&self, temp_id: &str) -> StoreResult<()>;

    async fn append_conflicts(&self, records: &[ConflictRecord]) -> StoreResult<()>;

    async fn list_conflicts(&self) -> StoreResult<Vec<ConflictRecord>>;

    /// Prune history older than `cutoff`. Returns the number of rows removed.
    async fn delete_conflicts_before(&self, cutoff: Timestamp) -> StoreResult<u64>;

    /// Apply all writes atomically, in order.
    ///
    /// Returns the changes created by [`StoreWrite::AddChange`] entries, with
    /// their assigned sequence numbers.
    async fn commit(&self, writes: Vec<StoreWrite>) -> StoreResult<Vec<PendingChange>>;

    async fn put_list(&self, list: &List) -> StoreResult<()> {
        self.commit(vec![StoreWrite::PutList(list.clone())]).await?;
        Ok(())
    }

    async fn delete_list(&self, id: &str) -> StoreResult<()> {
        self.commit(vec![StoreWrite::DeleteList(id.to_string())])
            .await?;
        Ok(())
    }

    async fn add_change(&self, change: NewChange) -> StoreResult<PendingChange> {
        self.commit(vec![StoreWrite::AddChange(change)])
            .await?
            .pop()
            .ok_or_else(|| StoreError::Corrupt("append returned no change".into()))
    }

    async fn update_change(&self, change: &PendingChange) -> StoreResult<()> {
        self.commit(vec![StoreWrite::UpdateChange(change.clone())])
            .await?;
        Ok(())
    }

    async fn remove_change(&self, id: ChangeId) -> StoreResult<()> {
        self.commit(vec![StoreWrite::RemoveChange(id)]).await?;
        Ok(())
    }

    async fn save_mapping(&self, mapping: &IdMapping) -> StoreResult<()> {
        self.commit(vec![StoreWrite::SaveMapping(mapping.clone())])
            .await?;
        Ok(())
    }
}
