//! Temporary id to server id reconciliation.
//!
//! Mappings are mirrored in memory under both ids. A miss falls through to
//! the durable store; if the store cannot answer either, the raw id is used.
//! Lookups never fail.

use crate::store::{DurableStore, StoreResult};
use dashmap::DashMap;
use listsync_engine::{sweep_candidates, EntityId, IdMapping, MappingStatus, Timestamp};
use std::sync::Arc;
use std::time::Duration;

/// A recreated list maps its old server id to a new one, so resolution may
/// follow more than one mapping.
const MAX_HOPS: usize = 8;

pub struct IdMap {
    store: Arc<dyn DurableStore>,
    by_temp: DashMap<EntityId, IdMapping>,
    /// actual id -> temp id
    by_actual: DashMap<EntityId, EntityId>,
    ttl: Duration,
}

impl IdMap {
    pub fn new(store: Arc<dyn DurableStore>, ttl: Duration) -> Self {
        Self {
            store,
            by_temp: DashMap::new(),
            by_actual: DashMap::new(),
            ttl,
        }
    }

    /// Warm the cache from the store.
    pub async fn load(&self) -> StoreResult<usize> {
        let mappings = self.store.all_mappings().await?;
        let count = mappings.len();
        for mapping in mappings {
            self.remember(mapping);
        }
        tracing::debug!(mappings = count, "Loaded id mappings");
        Ok(count)
    }

    /// Best known id for `id`: the server id once a completed mapping
    /// exists, the input unchanged otherwise.
    pub async fn resolve(&self, id: &str) -> EntityId {
        let mut current = id.to_string();
        for _ in 0..MAX_HOPS {
            let Some(mapping) = self.lookup(&current).await else {
                break;
            };
            if mapping.status != MappingStatus::Completed || mapping.actual_id == current {
                break;
            }
            current = mapping.actual_id;
        }
        current
    }

    /// Like [`IdMap::resolve`], from memory only.
    pub fn resolve_cached(&self, id: &str) -> EntityId {
        let mut current = id.to_string();
        for _ in 0..MAX_HOPS {
            let next = match self.by_temp.get(&current) {
                Some(mapping) if mapping.status == MappingStatus::Completed => {
                    mapping.actual_id.clone()
                }
                _ => break,
            };
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    /// Whether two ids refer to the same entity as far as memory knows.
    pub fn same_entity(&self, a: &str, b: &str) -> bool {
        a == b || self.resolve_cached(a) == self.resolve_cached(b)
    }

    /// The mapping with `id` on either side, from memory.
    pub fn get(&self, id: &str) -> Option<IdMapping> {
        if let Some(mapping) = self.by_temp.get(id) {
            return Some(mapping.clone());
        }
        let temp_id = self.by_actual.get(id)?.clone();
        self.by_temp.get(&temp_id).map(|m| m.clone())
    }

    /// Persist a mapping and mirror it.
    pub async fn record(
        &self,
        temp_id: &str,
        actual_id: &str,
        status: MappingStatus,
        now: Timestamp,
    ) -> StoreResult<IdMapping> {
        let mapping = IdMapping::new(temp_id, actual_id, status, now);
        self.store.save_mapping(&mapping).await?;
        self.remember(mapping.clone());
        Ok(mapping)
    }

    /// Mirror a mapping that was already persisted as part of a larger commit.
    pub fn remember(&self, mapping: IdMapping) {
        self.by_actual
            .insert(mapping.actual_id.clone(), mapping.temp_id.clone());
        self.by_temp.insert(mapping.temp_id.clone(), mapping);
    }

    /// Remove expired, settled, unreferenced mappings. Returns how many went.
    pub async fn sweep(&self, now: Timestamp) -> StoreResult<usize> {
        let mappings = self.store.all_mappings().await?;
        let changes = self.store.list_changes().await?;
        let removable: Vec<IdMapping> = sweep_candidates(&mappings, &changes, now, self.ttl)
            .into_iter()
            .cloned()
            .collect();

        for mapping in &removable {
            self.store.remove_mapping(&mapping.temp_id).await?;
            self.forget(mapping);
        }

        tracing::info!(
            removed = removable.len(),
            kept = mappings.len() - removable.len(),
            "Swept id mappings"
        );
        Ok(removable.len())
    }

    pub fn len(&self) -> usize {
        self.by_temp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_temp.is_empty()
    }

    async fn lookup(&self, id: &str) -> Option<IdMapping> {
        if let Some(mapping) = self.by_temp.get(id) {
            return Some(mapping.clone());
        }
        if self.by_actual.contains_key(id) {
            // known, and only as a target
            return None;
        }
        match self.store.get_mapping(id).await {
            Ok(Some(mapping)) => {
                self.remember(mapping.clone());
                (mapping.temp_id == id).then_some(mapping)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Mapping lookup failed, using raw id");
                None
            }
        }
    }

    fn forget(&self, mapping: &IdMapping) {
        self.by_temp.remove(&mapping.temp_id);
        self.by_actual
            .remove_if(&mapping.actual_id, |_, temp| *temp == mapping.temp_id);
    }
}

impl std::fmt::Debug for IdMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdMap")
            .field("mappings", &self.by_temp.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
