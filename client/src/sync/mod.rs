//! Queue draining.
//!
//! A drain loads the change log, groups it per entity and replays each
//! group in priority order. Groups run concurrently on a bounded number of
//! workers; inside a group every change waits for the one before it. A
//! group stops at the first change that cannot go through: a transient
//! failure leaves the rest pending for the next drain, an irrecoverable one
//! marks the rest failed. A change that failed transiently waits out a
//! jittered exponential backoff before any drain sends it again.

mod scheduler;

pub use scheduler::SyncScheduler;

use crate::api::{ApiError, ApiRequest, ErrorClass, RemoteApi};
use crate::config::SyncConfig;
use crate::connection::ConnectionHandle;
use crate::error::Result;
use crate::events::{DrainReport, SyncEvent, UpdateOrigin};
use crate::mapping::IdMap;
use crate::now_ms;
use crate::queue::PendingQueue;
use crate::resolver::ConflictResolver;
use crate::store::{DurableStore, StoreWrite};
use dashmap::DashMap;
use futures::StreamExt;
use listsync_engine::{
    group_changes, is_temp_id, ActionType, ChangeGroup, ChangeId, ConflictType, EntityId,
    IdMapping, List, MappingStatus, MergeOutcome, PendingChange, Version,
};
use serde_json::Value;
use rand::Rng;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How one change went.
#[derive(Debug)]
enum Step {
    Applied,
    /// Folded away or no longer pending by the time it was claimed
    Skipped,
    /// Leave this change and the rest of the group for a later drain
    Deferred,
    Failed(String),
}

/// Replay state carried from one change of a group to the next.
#[derive(Debug)]
struct GroupCursor {
    /// Best known id of the entity; changes after a create use the server id
    target: EntityId,
    /// Version returned by the last acknowledged change of this group
    version: Option<Version>,
}

/// Resets the single-flight flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) struct EngineCore {
    store: Arc<dyn DurableStore>,
    api: Arc<dyn RemoteApi>,
    queue: Arc<PendingQueue>,
    ids: Arc<IdMap>,
    resolver: Arc<ConflictResolver>,
    connection: ConnectionHandle,
    events: broadcast::Sender<SyncEvent>,
    config: SyncConfig,
    draining: AtomicBool,
    /// Earliest time each transiently failed change may be sent again
    retry_at: DashMap<ChangeId, Instant>,
}

/// Drains the pending-change queue against the remote API.
pub struct SyncEngine {
    core: Arc<EngineCore>,
    scheduler: Option<SyncScheduler>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn DurableStore>,
        api: Arc<dyn RemoteApi>,
        queue: Arc<PendingQueue>,
        ids: Arc<IdMap>,
        resolver: Arc<ConflictResolver>,
        connection: ConnectionHandle,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            core: Arc::new(EngineCore {
                store,
                api,
                queue,
                ids,
                resolver,
                connection,
                events,
                config,
                draining: AtomicBool::new(false),
                retry_at: DashMap::new(),
            }),
            scheduler: None,
        }
    }

    /// Run one drain now. A call made while another drain runs returns a
    /// report with `skipped` set and does nothing.
    pub async fn process_pending_changes(&self) -> Result<DrainReport> {
        self.core.process_pending_changes().await
    }

    /// Mapping sweep, conflict-history pruning and a history flush.
    pub async fn sweep(&self) -> Result<()> {
        self.core.sweep().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.core.events.subscribe()
    }

    pub(crate) fn events(&self) -> broadcast::Sender<SyncEvent> {
        self.core.events.clone()
    }

    /// Start the periodic, enqueue and connectivity triggers and the sweeper.
    pub fn start(&mut self) {
        if self.scheduler.is_none() {
            self.scheduler = Some(SyncScheduler::start(self.core.clone()));
        }
    }

    /// Stop the background tasks and flush the conflict history.
    pub async fn stop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop().await;
        }
        self.core.resolver.flush().await;
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_some()
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.core.config)
            .field("draining", &self.core.draining.load(Ordering::Relaxed))
            .field("running", &self.scheduler.is_some())
            .finish()
    }
}

impl EngineCore {
    pub(crate) async fn process_pending_changes(&self) -> Result<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Drain already running, skipping");
            return Ok(DrainReport::skipped());
        }
        let _guard = DrainGuard(&self.draining);

        let changes = self.queue.all_changes().await?;
        let pending_ids: HashSet<ChangeId> = changes
            .iter()
            .filter(|c| c.is_pending())
            .map(|c| c.id)
            .collect();
        self.retry_at.retain(|id, _| pending_ids.contains(id));
        let pending = pending_ids.len();
        if pending == 0 {
            return Ok(DrainReport::default());
        }
        if !self.connection.is_online() {
            tracing::debug!(pending, "Offline, leaving changes queued");
            return Ok(DrainReport {
                deferred: pending,
                ..Default::default()
            });
        }

        // pull mappings the cache has not seen yet so grouping can use memory only
        let entities: BTreeSet<&str> = changes
            .iter()
            .map(|c| c.entity_id.as_str())
            .filter(|id| is_temp_id(id))
            .collect();
        for id in entities {
            self.ids.resolve(id).await;
        }

        let groups = group_changes(changes, |id| self.ids.resolve_cached(id));
        let scheduled: usize = groups.iter().map(|g| g.changes.len()).sum();
        tracing::info!(
            groups = groups.len(),
            changes = scheduled,
            halted = pending.saturating_sub(scheduled),
            "Draining pending changes"
        );

        let mut report = futures::stream::iter(groups)
            .map(|group| self.process_group(group))
            .buffer_unordered(self.config.workers.max(1))
            .fold(DrainReport::default(), |mut report, group| async move {
                report.absorb(&group);
                report
            })
            .await;
        report.deferred += pending.saturating_sub(scheduled);

        tracing::info!(
            applied = report.applied,
            failed = report.failed,
            deferred = report.deferred,
            "Drain finished"
        );
        self.emit(SyncEvent::DrainCompleted(report.clone()));
        Ok(report)
    }

    async fn process_group(&self, group: ChangeGroup) -> DrainReport {
        let total = group.changes.len();
        let mut report = DrainReport {
            groups: 1,
            ..Default::default()
        };
        let mut cursor = GroupCursor {
            target: group.entity_id.clone(),
            version: None,
        };
        let mut done = 0;

        for (index, batch) in group.batches(self.config.batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }
            for change in batch {
                if !self.connection.is_online() {
                    report.deferred += total - done;
                    return report;
                }
                if let Some(wait) = self.backoff_remaining(change.id) {
                    tracing::debug!(change_id = change.id, ?wait, "Backing off, group left for later");
                    report.deferred += total - done;
                    return report;
                }

                let step = match self.process_change(change.id, &mut cursor).await {
                    Ok(step) => step,
                    Err(e) => {
                        tracing::warn!(change_id = change.id, error = %e, "Store error during replay");
                        self.queue.release(change.id).await;
                        Step::Deferred
                    }
                };

                if !matches!(step, Step::Deferred) {
                    self.retry_at.remove(&change.id);
                }
                match step {
                    Step::Applied => report.applied += 1,
                    Step::Skipped => {}
                    Step::Deferred => {
                        report.deferred += total - done;
                        return report;
                    }
                    Step::Failed(error) => {
                        let halted: Vec<ChangeId> =
                            group.changes[done..].iter().map(|c| c.id).collect();
                        report.failed += self.fail_changes(&cursor.target, &halted, error).await;
                        return report;
                    }
                }
                done += 1;
            }
        }
        report
    }

    async fn process_change(&self, id: ChangeId, cursor: &mut GroupCursor) -> Result<Step> {
        let Some(change) = self.queue.claim(id).await? else {
            return Ok(Step::Skipped);
        };
        let step = self.send_change(&change, cursor).await;
        // no-op when the change was acknowledged
        self.queue.release(change.id).await;
        step
    }

    async fn send_change(&self, change: &PendingChange, cursor: &mut GroupCursor) -> Result<Step> {
        let local = self.store.get_list(&cursor.target).await?;
        let base_version = cursor.version.unwrap_or_else(|| {
            change
                .base_version
                .max(local.as_ref().map(|l| l.version).unwrap_or(0))
        });

        let request = match ApiRequest::from_change(change, &cursor.target, base_version) {
            Ok(request) => request,
            Err(e) => return Ok(Step::Failed(e.to_string())),
        };

        tracing::debug!(
            change_id = change.id,
            action = %change.action_type.as_str(),
            entity_id = %cursor.target,
            base_version,
            "Replaying change"
        );

        match self.api.execute(&request).await {
            Ok(server) => {
                let reconcile = (change.action_type == ActionType::CreateList)
                    .then(|| cursor.target.clone());
                self.acknowledge(change, cursor, server, reconcile).await
            }
            Err(ApiError::NotFound) if is_delete(change.action_type) => {
                tracing::debug!(change_id = change.id, "Already gone on the server");
                self.acknowledge(change, cursor, None, None).await
            }
            Err(ApiError::Conflict {
                server_data,
                conflict_type,
            }) => {
                self.resolve_conflict(change, cursor, request, server_data, conflict_type)
                    .await
            }
            Err(e) => self.failure_step(change, e).await,
        }
    }

    async fn resolve_conflict(
        &self,
        change: &PendingChange,
        cursor: &mut GroupCursor,
        request: ApiRequest,
        server_data: Option<Value>,
        conflict_type: ConflictType,
    ) -> Result<Step> {
        tracing::info!(
            change_id = change.id,
            entity_id = %cursor.target,
            conflict = %conflict_type,
            "Version conflict"
        );

        let Some(local) = self.store.get_list(&cursor.target).await? else {
            // nothing local to merge (the list was deleted here): the write
            // goes again against the server's current version
            return self
                .retry_against_server(change, cursor, request, server_data)
                .await;
        };

        let outcome = match self
            .resolver
            .resolve(&local, server_data.as_ref(), conflict_type)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return Ok(Step::Failed(format!("conflict resolution failed: {e}"))),
        };

        match outcome {
            MergeOutcome::Merged(merged) => {
                self.store.put_list(&merged).await?;
                let retry = if change.action_type == ActionType::UpdateList {
                    ApiRequest::replace_list(&merged)
                } else {
                    request.with_base_version(merged.version)
                };
                self.retry_once(change, cursor, retry, None).await
            }
            MergeOutcome::Recreate(list) => {
                tracing::info!(entity_id = %cursor.target, "Local edits outlive remote delete, recreating");
                let reconcile = Some(cursor.target.clone());
                self.retry_once(change, cursor, ApiRequest::CreateList { list }, reconcile)
                    .await
            }
            MergeOutcome::Deleted => {
                let target = cursor.target.clone();
                self.queue
                    .acknowledge(change.id, &target, |_, _| {
                        (vec![StoreWrite::DeleteList(target.clone())], ())
                    })
                    .await?;
                self.emit(SyncEvent::EntityDeleted { id: target });
                Ok(Step::Applied)
            }
        }
    }

    async fn retry_against_server(
        &self,
        change: &PendingChange,
        cursor: &mut GroupCursor,
        request: ApiRequest,
        server_data: Option<Value>,
    ) -> Result<Step> {
        let version = match server_data
            .as_ref()
            .and_then(|data| data.get("version"))
            .and_then(Value::as_u64)
        {
            Some(version) => version,
            None => match self.api.fetch_list(&cursor.target).await {
                Ok(server) => server.version,
                Err(ApiError::NotFound) if is_delete(change.action_type) => {
                    return self.acknowledge(change, cursor, None, None).await;
                }
                Err(e) => return self.failure_step(change, e).await,
            },
        };
        self.retry_once(change, cursor, request.with_base_version(version), None)
            .await
    }

    /// The single post-merge retry. A second conflict is final.
    async fn retry_once(
        &self,
        change: &PendingChange,
        cursor: &mut GroupCursor,
        request: ApiRequest,
        reconcile: Option<EntityId>,
    ) -> Result<Step> {
        match self.api.execute(&request).await {
            Ok(server) => self.acknowledge(change, cursor, server, reconcile).await,
            Err(ApiError::NotFound) if is_delete(change.action_type) => {
                self.acknowledge(change, cursor, None, None).await
            }
            Err(e) if e.class() == ErrorClass::Conflict => Ok(Step::Failed(format!(
                "conflict persisted after merge: {e}"
            ))),
            Err(e) => self.failure_step(change, e).await,
        }
    }

    async fn failure_step(&self, change: &PendingChange, error: ApiError) -> Result<Step> {
        match error.class() {
            ErrorClass::Transient => {
                let retries = self.queue.bump_retry(change).await?;
                if retries >= self.config.max_retries {
                    return Ok(Step::Failed(format!(
                        "{error} (gave up after {retries} attempts)"
                    )));
                }
                let delay = self.config.retry_backoff.delay(retries, self.jitter());
                self.retry_at.insert(change.id, Instant::now() + delay);
                tracing::warn!(
                    change_id = change.id,
                    retries,
                    ?delay,
                    error = %error,
                    "Transient failure, will retry after backoff"
                );
                Ok(Step::Deferred)
            }
            ErrorClass::Fatal => {
                tracing::error!(error = %error, "Credentials rejected, halting sync");
                self.connection.auth_failed(error.to_string());
                Ok(Step::Deferred)
            }
            ErrorClass::Permanent | ErrorClass::Conflict => Ok(Step::Failed(error.to_string())),
        }
    }

    /// Remove an acknowledged change and bring the local copy in line with
    /// the server. `reconcile` names the id the entity had before this write
    /// when the server may have assigned a new one (create, recreate).
    async fn acknowledge(
        &self,
        change: &PendingChange,
        cursor: &mut GroupCursor,
        server: Option<List>,
        reconcile: Option<EntityId>,
    ) -> Result<Step> {
        let previous = cursor.target.clone();
        let now = now_ms();
        let deletes = change.action_type == ActionType::DeleteList;

        let mapping = match (&reconcile, &server) {
            (Some(old_id), Some(server)) if *old_id != server.id => Some(IdMapping::new(
                old_id.clone(),
                server.id.clone(),
                MappingStatus::Completed,
                now,
            )),
            _ => None,
        };

        let server_copy = server.clone();
        let mapping_write = mapping.clone();
        let stale_id = previous.clone();
        let stored = self
            .queue
            .acknowledge(change.id, &previous, move |local, outstanding| {
                let mut writes = Vec::new();
                if deletes {
                    writes.push(StoreWrite::DeleteList(stale_id));
                    return (writes, None);
                }
                if let Some(mapping) = mapping_write {
                    writes.push(StoreWrite::SaveMapping(mapping));
                    writes.push(StoreWrite::DeleteList(stale_id));
                }
                let rest = outstanding.len() as u64;
                if outstanding
                    .iter()
                    .any(|c| c.action_type == ActionType::DeleteList)
                {
                    // deleted locally, the delete is still queued
                    return (writes, None);
                }
                let stored = match (server_copy, local) {
                    (Some(server), _) if rest == 0 => Some(List {
                        local_revision: 0,
                        ..server
                    }),
                    (Some(server), Some(local)) => Some(List {
                        id: server.id.clone(),
                        version: server.version,
                        local_revision: rest,
                        ..local
                    }),
                    (Some(server), None) => Some(List {
                        local_revision: rest,
                        ..server
                    }),
                    (None, Some(local)) => Some(List {
                        local_revision: rest,
                        ..local
                    }),
                    (None, None) => None,
                };
                if let Some(list) = &stored {
                    writes.push(StoreWrite::PutList(list.clone()));
                }
                (writes, stored)
            })
            .await?;

        if let Some(server) = &server {
            cursor.version = Some(server.version);
        }

        if let Some(mapping) = mapping {
            tracing::info!(
                temp_id = %mapping.temp_id,
                actual_id = %mapping.actual_id,
                "Entity reconciled with server id"
            );
            cursor.target = mapping.actual_id.clone();
            self.ids.remember(mapping.clone());
            self.connection.leave_list(mapping.temp_id.clone());
            self.connection.join_list(mapping.actual_id.clone());
            self.emit(SyncEvent::IdReconciled {
                temp_id: mapping.temp_id,
                actual_id: mapping.actual_id,
            });
        }

        if deletes {
            self.emit(SyncEvent::EntityDeleted {
                id: cursor.target.clone(),
            });
        } else if let Some(list) = stored {
            self.emit(SyncEvent::EntityUpdated {
                list,
                origin: UpdateOrigin::Sync,
            });
        }

        tracing::debug!(change_id = change.id, entity_id = %cursor.target, "Change acknowledged");
        Ok(Step::Applied)
    }

    /// Mark `ids` failed and tell the UI. Returns how many were marked.
    async fn fail_changes(&self, entity_id: &str, ids: &[ChangeId], error: String) -> usize {
        tracing::error!(
            entity_id = %entity_id,
            changes = ids.len(),
            error = %error,
            "Change failed, halting entity group"
        );
        for id in ids {
            self.retry_at.remove(id);
        }
        match self.queue.mark_failed(ids).await {
            Ok(failed) => {
                let change_ids: Vec<ChangeId> = failed.iter().map(|c| c.id).collect();
                let count = change_ids.len();
                self.emit(SyncEvent::ChangesFailed {
                    entity_id: entity_id.to_string(),
                    change_ids,
                    error,
                });
                count
            }
            Err(e) => {
                tracing::error!(entity_id = %entity_id, error = %e, "Could not mark changes failed");
                0
            }
        }
    }

    pub(crate) async fn sweep(&self) -> Result<()> {
        let now = now_ms();
        self.queue.sweep_mappings(now).await?;
        self.resolver
            .prune(now, self.config.conflict_retention)
            .await?;
        self.resolver.flush().await;
        Ok(())
    }

    fn backoff_remaining(&self, id: ChangeId) -> Option<Duration> {
        let at = *self.retry_at.get(&id)?;
        at.checked_duration_since(Instant::now())
            .filter(|wait| !wait.is_zero())
    }

    /// Earliest retry deadline later than `after`.
    pub(crate) fn next_retry(&self, after: Option<Instant>) -> Option<Instant> {
        self.retry_at
            .iter()
            .map(|entry| *entry.value())
            .filter(|at| after.map_or(true, |after| *at > after))
            .min()
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.config.retry_jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    fn emit(&self, event: SyncEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

fn is_delete(action: ActionType) -> bool {
    matches!(
        action,
        ActionType::DeleteList | ActionType::DeleteItem | ActionType::UnshareList
    )
}
