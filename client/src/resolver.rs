//! Conflict resolution service.
//!
//! Wraps the pure [`ConflictStrategies`] with the parts that need IO:
//! fetching server state when the 409 carried none, retrying transient
//! failures, and the conflict history. History is buffered and written in
//! batches; a failed write is logged and dropped, never surfaced to the
//! resolution it describes.

use crate::api::{ErrorClass, RemoteApi};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::now_ms;
use crate::store::{DurableStore, StoreResult};
use listsync_engine::{
    ConflictRecord, ConflictStrategies, ConflictType, List, MergeOutcome, ResolutionStatus,
    Timestamp,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct ConflictResolver {
    strategies: ConflictStrategies,
    api: Arc<dyn RemoteApi>,
    store: Arc<dyn DurableStore>,
    history: Mutex<Vec<ConflictRecord>>,
    flush_threshold: usize,
    attempts: u32,
    delay: Duration,
}

impl ConflictResolver {
    pub fn new(api: Arc<dyn RemoteApi>, store: Arc<dyn DurableStore>, config: &SyncConfig) -> Self {
        Self {
            strategies: ConflictStrategies::default(),
            api,
            store,
            history: Mutex::new(Vec::new()),
            flush_threshold: config.conflict_flush_threshold.max(1),
            attempts: config.resolver_attempts.max(1),
            delay: config.resolver_delay,
        }
    }

    /// Replace the strategy registry.
    pub fn with_strategies(mut self, strategies: ConflictStrategies) -> Self {
        self.strategies = strategies;
        self
    }

    /// Resolve `local` against the server's side of a conflict.
    ///
    /// `server_data` is the body the 409 carried, if any. Transient failures
    /// are retried; every outcome lands in the conflict history.
    pub async fn resolve(
        &self,
        local: &List,
        server_data: Option<&Value>,
        conflict_type: ConflictType,
    ) -> Result<MergeOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_resolve(local, server_data, conflict_type).await {
                Ok((outcome, server)) => {
                    tracing::info!(
                        entity_id = %local.id,
                        conflict = %conflict_type,
                        outcome = outcome_name(&outcome),
                        attempt,
                        "Conflict resolved"
                    );
                    self.record(ConflictRecord {
                        conflict_type,
                        local_data: to_value(local),
                        server_data: server,
                        timestamp: now_ms(),
                        resolution: ResolutionStatus::Auto,
                        metadata: json!({
                            "entityId": local.id,
                            "attempts": attempt,
                            "outcome": outcome_name(&outcome),
                        }),
                    })
                    .await;
                    return Ok(outcome);
                }
                Err(err) if is_transient(&err) && attempt < self.attempts => {
                    tracing::warn!(
                        entity_id = %local.id,
                        "Conflict resolution failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt,
                        self.attempts,
                        err,
                        self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                }
                Err(err) => {
                    tracing::error!(
                        entity_id = %local.id,
                        conflict = %conflict_type,
                        attempt,
                        error = %err,
                        "Conflict resolution failed"
                    );
                    self.record(ConflictRecord {
                        conflict_type,
                        local_data: to_value(local),
                        server_data: server_data.cloned().unwrap_or(Value::Null),
                        timestamp: now_ms(),
                        resolution: ResolutionStatus::Failed,
                        metadata: json!({
                            "entityId": local.id,
                            "attempts": attempt,
                            "error": err.to_string(),
                        }),
                    })
                    .await;
                    return Err(err);
                }
            }
        }
    }

    async fn try_resolve(
        &self,
        local: &List,
        server_data: Option<&Value>,
        conflict_type: ConflictType,
    ) -> Result<(MergeOutcome, Value)> {
        let server = match (server_data, conflict_type) {
            (Some(data), _) => Some(List::from_value(data)?),
            (None, ConflictType::Update) => Some(self.api.fetch_list(&local.id).await?),
            // a delete tombstone has no body to fetch
            (None, ConflictType::Delete) => None,
        };
        let outcome = self
            .strategies
            .resolve(local, server.as_ref(), conflict_type)?;
        let server = server.as_ref().map(to_value).unwrap_or(Value::Null);
        Ok((outcome, server))
    }

    async fn record(&self, record: ConflictRecord) {
        let full = {
            let mut history = self.lock_history();
            history.push(record);
            history.len() >= self.flush_threshold
        };
        if full {
            self.flush().await;
        }
    }

    /// Write buffered history to the store. Returns how many records were
    /// written; failures are logged and the batch is dropped.
    pub async fn flush(&self) -> usize {
        let records = std::mem::take(&mut *self.lock_history());
        if records.is_empty() {
            return 0;
        }
        match self.store.append_conflicts(&records).await {
            Ok(()) => {
                tracing::debug!(records = records.len(), "Flushed conflict history");
                records.len()
            }
            Err(e) => {
                tracing::warn!(records = records.len(), error = %e, "Dropping conflict history batch");
                0
            }
        }
    }

    /// Records waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.lock_history().len()
    }

    /// Drop history older than `retention`.
    pub async fn prune(&self, now: Timestamp, retention: Duration) -> StoreResult<u64> {
        let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
        let removed = self
            .store
            .delete_conflicts_before(now.saturating_sub(retention_ms))
            .await?;
        if removed > 0 {
            tracing::info!(removed, "Pruned conflict history");
        }
        Ok(removed)
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, Vec<ConflictRecord>> {
        // a poisoned buffer only ever loses audit records
        self.history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("strategies", &self.strategies)
            .field("buffered", &self.buffered())
            .field("attempts", &self.attempts)
            .finish()
    }
}

fn is_transient(err: &Error) -> bool {
    matches!(err, Error::Api(e) if e.class() == ErrorClass::Transient)
}

fn outcome_name(outcome: &MergeOutcome) -> &'static str {
    match outcome {
        MergeOutcome::Merged(_) => "merged",
        MergeOutcome::Recreate(_) => "recreate",
        MergeOutcome::Deleted => "deleted",
    }
}

fn to_value(list: &List) -> Value {
    serde_json::to_value(list).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, ApiRequest, ApiResult};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use listsync_engine::Item;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers `fetch_list` from a script.
    #[derive(Default)]
    struct FetchScript {
        replies: Mutex<VecDeque<ApiResult<List>>>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl RemoteApi for FetchScript {
        async fn execute(&self, _request: &ApiRequest) -> ApiResult<Option<List>> {
            Err(ApiError::Rejected {
                status: 400,
                message: "not scripted".into(),
            })
        }

        async fn fetch_list(&self, _id: &str) -> ApiResult<List> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ApiError::NotFound))
        }

        async fn health(&self) -> ApiResult<()> {
            Ok(())
        }
    }

    fn list(id: &str, version: u64, items: Vec<Item>) -> List {
        let mut list = List::new(id, "Groceries", "me", 10);
        list.version = version;
        list.items = items;
        list
    }

    fn resolver(api: Arc<FetchScript>, store: Arc<MemoryStore>, threshold: usize) -> ConflictResolver {
        let config = SyncConfig::default()
            .with_conflict_flush_threshold(threshold)
            .with_resolver_retry(3, Duration::from_millis(100));
        ConflictResolver::new(api, store, &config)
    }

    #[tokio::test]
    async fn merges_with_server_data_from_the_conflict() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(Arc::new(FetchScript::default()), store.clone(), 1);

        let local = list("srv-1", 2, vec![Item::new("i1", "a", 0, 100)]);
        let server = list("srv-1", 5, vec![Item::new("i1", "b", 0, 200)]);
        let outcome = resolver
            .resolve(&local, Some(&to_value(&server)), ConflictType::Update)
            .await
            .unwrap();

        let MergeOutcome::Merged(merged) = outcome else {
            panic!("expected a merge");
        };
        assert_eq!(merged.version, 5);
        assert_eq!(merged.items[0].text, "b");

        let history = store.list_conflicts().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].resolution, ResolutionStatus::Auto);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_fetch_failures_are_retried() {
        let api = Arc::new(FetchScript::default());
        {
            let mut replies = api.replies.lock().unwrap();
            replies.push_back(Err(ApiError::Timeout));
            replies.push_back(Ok(list("srv-1", 4, vec![])));
        }
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(api.clone(), store, 10);

        let outcome = resolver
            .resolve(&list("srv-1", 1, vec![]), None, ConflictType::Update)
            .await
            .unwrap();
        assert!(matches!(outcome, MergeOutcome::Merged(ref l) if l.version == 4));
        assert_eq!(api.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.buffered(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let api = Arc::new(FetchScript::default());
        {
            let mut replies = api.replies.lock().unwrap();
            for _ in 0..5 {
                replies.push_back(Err(ApiError::Network("reset".into())));
            }
        }
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(api.clone(), store.clone(), 1);

        let err = resolver
            .resolve(&list("srv-1", 1, vec![]), None, ConflictType::Update)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Api(ApiError::Network(_))));
        assert_eq!(api.fetches.load(Ordering::SeqCst), 3);

        let history = store.list_conflicts().await.unwrap();
        assert_eq!(history[0].resolution, ResolutionStatus::Failed);
    }

    #[tokio::test]
    async fn invalid_merge_is_not_retried() {
        let api = Arc::new(FetchScript::default());
        let resolver = resolver(api.clone(), Arc::new(MemoryStore::new()), 10);

        let err = resolver
            .resolve(
                &list("srv-1", 1, vec![]),
                Some(&json!({"id": "", "items": []})),
                ConflictType::Update,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
        assert_eq!(api.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn history_failures_never_block_resolution() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(Arc::new(FetchScript::default()), store.clone(), 1);
        store.set_unavailable(true);

        let mut local = list("temp-1", 0, vec![]);
        local.local_revision = 2;
        let outcome = resolver
            .resolve(&local, None, ConflictType::Delete)
            .await
            .unwrap();
        assert!(matches!(outcome, MergeOutcome::Recreate(_)));
        assert_eq!(resolver.buffered(), 0);
    }

    #[tokio::test]
    async fn prune_removes_old_history() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(Arc::new(FetchScript::default()), store.clone(), 100);
        store
            .append_conflicts(&[
                ConflictRecord {
                    conflict_type: ConflictType::Update,
                    local_data: Value::Null,
                    server_data: Value::Null,
                    timestamp: 1_000,
                    resolution: ResolutionStatus::Auto,
                    metadata: Value::Null,
                },
                ConflictRecord {
                    conflict_type: ConflictType::Delete,
                    local_data: Value::Null,
                    server_data: Value::Null,
                    timestamp: 9_000,
                    resolution: ResolutionStatus::Failed,
                    metadata: Value::Null,
                },
            ])
            .await
            .unwrap();

        let removed = resolver
            .prune(10_000, Duration::from_millis(5_000))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_conflicts().await.unwrap().len(), 1);
    }
}
