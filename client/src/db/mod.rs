//! SQLite persistence for the durable store.

mod changes;
mod conflicts;
mod lists;
mod mappings;
mod pool;

pub use changes::*;
pub use conflicts::*;
pub use lists::*;
pub use mappings::*;
pub use pool::*;

use crate::error::StoreError;
use crate::store::{DurableStore, StoreResult, StoreWrite};
use async_trait::async_trait;
use listsync_engine::{
    ChangeId, ConflictRecord, IdMapping, List, MappingStatus, PendingChange, Timestamp,
};

/// A [`DurableStore`] on SQLite. Every commit runs in one transaction.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations must already have run.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open the database at `database_url` and bring its schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = create_pool(database_url).await?;
        tracing::info!("Running database migrations...");
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get_list(&self, id: &str) -> StoreResult<Option<List>> {
        get_list(&self.pool, id).await
    }

    async fn all_lists(&self) -> StoreResult<Vec<List>> {
        get_all_lists(&self.pool).await
    }

    async fn list_changes(&self) -> StoreResult<Vec<PendingChange>> {
        get_all_changes(&self.pool).await
    }

    async fn get_change(&self, id: ChangeId) -> StoreResult<Option<PendingChange>> {
        get_change(&self.pool, id).await
    }

    async fn get_mapping(&self, id: &str) -> StoreResult<Option<IdMapping>> {
        find_mapping(&self.pool, id).await
    }

    async fn all_mappings(&self) -> StoreResult<Vec<IdMapping>> {
        get_all_mappings(&self.pool).await
    }

    async fn update_mapping_status(
        &self,
        temp_id: &str,
        status: MappingStatus,
    ) -> StoreResult<()> {
        update_mapping_status(&self.pool, temp_id, status).await
    }

    async fn remove_mapping(&self, temp_id: &str) -> StoreResult<()> {
        delete_mapping(&self.pool, temp_id).await
    }

    async fn append_conflicts(&self, records: &[ConflictRecord]) -> StoreResult<()> {
        insert_conflicts(&self.pool, records).await
    }

    async fn list_conflicts(&self) -> StoreResult<Vec<ConflictRecord>> {
        get_conflicts(&self.pool).await
    }

    async fn delete_conflicts_before(&self, cutoff: Timestamp) -> StoreResult<u64> {
        delete_conflicts_before(&self.pool, cutoff).await
    }

    async fn commit(&self, writes: Vec<StoreWrite>) -> StoreResult<Vec<PendingChange>> {
        let mut tx = self.pool.begin().await?;
        let mut added = Vec::new();

        for write in writes {
            match write {
                StoreWrite::PutList(list) => upsert_list(&mut *tx, &list).await?,
                StoreWrite::DeleteList(id) => delete_list(&mut *tx, &id).await?,
                StoreWrite::AddChange(change) => added.push(insert_change(&mut *tx, change).await?),
                StoreWrite::UpdateChange(change) => update_change(&mut *tx, &change).await?,
                StoreWrite::RemoveChange(id) => delete_change(&mut *tx, id).await?,
                StoreWrite::SaveMapping(mapping) => upsert_mapping(&mut *tx, &mapping).await?,
            }
        }

        // Dropping the transaction on an early return rolls it back
        tx.commit().await?;
        Ok(added)
    }
}
