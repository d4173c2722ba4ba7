//! UI-facing facade.
//!
//! Every edit is applied to the local copy first and queued in the same
//! commit, so the UI sees it immediately and the sync engine replays it
//! when the connection allows.

use crate::api::RemoteApi;
use crate::auth::AuthToken;
use crate::config::{ConnectionConfig, SyncConfig};
use crate::connection::{ConnectionHandle, ConnectionManager, RemoteUpdate};
use crate::error::{Error, Result, StoreError};
use crate::events::{DrainReport, SyncEvent, UpdateOrigin};
use crate::mapping::IdMap;
use crate::now_ms;
use crate::queue::{EnqueueOutcome, PendingQueue};
use crate::resolver::ConflictResolver;
use crate::store::{DurableStore, StoreWrite};
use crate::sync::SyncEngine;
use crate::websocket::RealtimeTransport;
use listsync_engine::{
    is_temp_id, new_temp_id, ActionType, AddItemsPayload, ChangeId, ConnectionStatus,
    DeleteItemPayload, EntityId, Item, ItemId, List, NewChange, PendingChange, Permission,
    ReorderItemsPayload, Share, SharePayload, Timestamp, UnsharePayload, UpdateItemPayload,
    Version,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The offline-first list client.
pub struct SyncClient {
    store: Arc<dyn DurableStore>,
    api: Arc<dyn RemoteApi>,
    queue: Arc<PendingQueue>,
    ids: Arc<IdMap>,
    connection: ConnectionManager,
    handle: ConnectionHandle,
    engine: SyncEngine,
    events: broadcast::Sender<SyncEvent>,
    owner: String,
    cancel: CancellationToken,
    push_task: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(
        store: Arc<dyn DurableStore>,
        api: Arc<dyn RemoteApi>,
        transport: Arc<dyn RealtimeTransport>,
        sync: SyncConfig,
        connection: ConnectionConfig,
    ) -> Self {
        let ids = Arc::new(IdMap::new(store.clone(), sync.mapping_ttl));
        let queue = Arc::new(PendingQueue::new(store.clone(), ids.clone()));
        let resolver = Arc::new(ConflictResolver::new(api.clone(), store.clone(), &sync));
        let connection = ConnectionManager::new(connection, transport);
        let handle = connection.handle();
        let engine = SyncEngine::new(
            store.clone(),
            api.clone(),
            queue.clone(),
            ids.clone(),
            resolver,
            handle.clone(),
            sync,
        );
        let events = engine.events();

        Self {
            store,
            api,
            queue,
            ids,
            connection,
            handle,
            engine,
            events,
            owner: String::new(),
            cancel: CancellationToken::new(),
            push_task: None,
        }
    }

    /// Owner recorded on lists created by this client.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Load the id mappings, then start the connection manager, the sync
    /// engine and the remote-update applier. Known server lists are
    /// subscribed as soon as the connection opens.
    pub async fn start(&mut self) -> Result<()> {
        if self.push_task.is_some() {
            return Ok(());
        }
        let mappings = self.ids.load().await?;

        self.connection.start();
        for list in self.store.all_lists().await? {
            if !is_temp_id(&list.id) {
                self.handle.join_list(list.id);
            }
        }
        self.engine.start();

        let applier = RemoteApplier {
            queue: self.queue.clone(),
            ids: self.ids.clone(),
            events: self.events.clone(),
        };
        self.push_task = Some(tokio::spawn(applier.run(
            self.handle.remote_updates(),
            self.cancel.clone(),
        )));

        tracing::info!(mappings, "Sync client started");
        Ok(())
    }

    /// Stop in reverse start order.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.push_task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Update applier ended abnormally: {}", e);
            }
        }
        self.engine.stop().await;
        self.connection.stop().await;
        tracing::info!("Sync client stopped");
    }

    // Connection

    /// Connect, or re-authenticate after a rejected token. The remote API
    /// switches to `token` before the realtime session opens.
    pub fn connect(&self, token: AuthToken) {
        self.api.set_token(&token);
        self.handle.connect(token);
    }

    pub fn disconnect(&self) {
        self.handle.disconnect();
    }

    pub fn handle_foreground(&self) {
        self.handle.handle_foreground();
    }

    pub fn handle_background(&self) {
        self.handle.handle_background();
    }

    pub fn set_network_available(&self, available: bool) {
        self.handle.set_network_available(available);
    }

    pub async fn join_list(&self, id: &str) {
        self.handle.join_list(self.ids.resolve(id).await);
    }

    pub async fn leave_list(&self, id: &str) {
        self.handle.leave_list(self.ids.resolve(id).await);
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.handle
    }

    // Sync

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Drain the queue now instead of waiting for a trigger.
    pub async fn sync_now(&self) -> Result<DrainReport> {
        self.engine.process_pending_changes().await
    }

    pub async fn pending_change_count(&self) -> Result<usize> {
        self.queue.pending_count().await
    }

    /// Queue a raw change without touching the local copy.
    pub async fn enqueue_change(
        &self,
        action: ActionType,
        entity_id: &str,
        payload: Value,
        base_version: Version,
    ) -> Result<EnqueueOutcome> {
        self.queue
            .enqueue(action, entity_id, payload, base_version)
            .await
    }

    pub async fn failed_changes(&self) -> Result<Vec<PendingChange>> {
        self.queue.failed().await
    }

    pub async fn retry_failed(&self, id: ChangeId) -> Result<PendingChange> {
        self.queue.retry_failed(id).await
    }

    pub async fn discard_failed(&self, id: ChangeId) -> Result<PendingChange> {
        self.queue.discard_failed(id).await
    }

    // Reads

    /// The local copy of a list, by temp or server id.
    pub async fn list(&self, id: &str) -> Result<Option<List>> {
        let id = self.ids.resolve(id).await;
        Ok(self.store.get_list(&id).await?)
    }

    pub async fn lists(&self) -> Result<Vec<List>> {
        Ok(self.store.all_lists().await?)
    }

    // Optimistic edits

    /// Create a list offline under a temporary id.
    pub async fn create_list(&self, title: impl Into<String>) -> Result<List> {
        let now = now_ms();
        let mut list = List::new(new_temp_id(Uuid::new_v4()), title, self.owner.clone(), now);
        list.validate()?;
        let payload = to_payload(&list)?;
        list.local_revision = 1;

        let id = list.id.clone();
        let (_, list) = self
            .queue
            .enqueue_edit(&id, |_| {
                let change = NewChange::new(ActionType::CreateList, id.clone(), payload, now, 0);
                Ok((change, vec![StoreWrite::PutList(list.clone())], list))
            })
            .await?;

        tracing::info!(entity_id = %list.id, "List created locally");
        self.emit(SyncEvent::EntityUpdated {
            list: list.clone(),
            origin: UpdateOrigin::Local,
        });
        Ok(list)
    }

    /// Apply a `title`/`items`/`sharedWith` patch.
    pub async fn update_list(&self, id: &str, patch: Map<String, Value>) -> Result<List> {
        self.edit_list(id, ActionType::UpdateList, |list, now| {
            list.apply_patch(&patch, now)?;
            Ok(Value::Object(patch))
        })
        .await
    }

    pub async fn delete_list(&self, id: &str) -> Result<()> {
        let id = self.ids.resolve(id).await;
        let now = now_ms();
        self.queue
            .enqueue_edit(&id, |local| {
                let list = local.ok_or_else(|| Error::NotFound(format!("list {id}")))?;
                let change = NewChange::new(
                    ActionType::DeleteList,
                    id.clone(),
                    Value::Null,
                    now,
                    list.version,
                );
                Ok((change, vec![StoreWrite::DeleteList(id.clone())], ()))
            })
            .await?;

        tracing::info!(entity_id = %id, "List deleted locally");
        self.handle.leave_list(id.clone());
        self.emit(SyncEvent::EntityDeleted { id });
        Ok(())
    }

    pub async fn share_list(
        &self,
        id: &str,
        user_ref: impl Into<String>,
        permission: Permission,
    ) -> Result<List> {
        let share = SharePayload {
            user_ref: user_ref.into(),
            permission,
        };
        self.edit_list(id, ActionType::ShareList, |list, now| {
            list.share(
                Share {
                    user_ref: share.user_ref.clone(),
                    permission: share.permission,
                },
                now,
            );
            to_payload(&share)
        })
        .await
    }

    pub async fn unshare_list(&self, id: &str, user_ref: &str) -> Result<List> {
        self.edit_list(id, ActionType::UnshareList, |list, now| {
            list.unshare(user_ref, now);
            to_payload(&UnsharePayload {
                user_ref: user_ref.to_string(),
            })
        })
        .await
    }

    /// Append an item at the end of the list. Item ids are generated here
    /// and never change.
    pub async fn add_item(&self, list_id: &str, text: impl Into<String>) -> Result<Item> {
        let text = text.into();
        let mut added = None;
        self.edit_list(list_id, ActionType::AddItem, |list, now| {
            let position = list
                .items
                .iter()
                .map(|item| item.position + 1)
                .max()
                .unwrap_or(0);
            let item = Item::new(Uuid::new_v4().to_string(), text, position, now);
            list.add_items(std::slice::from_ref(&item), now);
            let payload = to_payload(&AddItemsPayload {
                items: vec![item.clone()],
            });
            added = Some(item);
            payload
        })
        .await?;
        added.ok_or_else(|| Error::BadRequest("item was not added".into()))
    }

    pub async fn update_item(
        &self,
        list_id: &str,
        item_id: &str,
        changes: Map<String, Value>,
    ) -> Result<List> {
        self.edit_list(list_id, ActionType::UpdateItem, |list, now| {
            list.update_item(item_id, &changes, now)?;
            to_payload(&UpdateItemPayload {
                item_id: item_id.to_string(),
                changes,
            })
        })
        .await
    }

    pub async fn delete_item(&self, list_id: &str, item_id: &str) -> Result<List> {
        self.edit_list(list_id, ActionType::DeleteItem, |list, now| {
            list.remove_item(item_id, now)?;
            to_payload(&DeleteItemPayload {
                item_id: item_id.to_string(),
            })
        })
        .await
    }

    pub async fn reorder_items(&self, list_id: &str, item_ids: Vec<ItemId>) -> Result<List> {
        self.edit_list(list_id, ActionType::ReorderItem, |list, now| {
            list.reorder_items(&item_ids, now);
            to_payload(&ReorderItemsPayload { item_ids })
        })
        .await
    }

    /// Apply `edit` to the local copy and queue `action` with the payload it
    /// returns, in one commit.
    async fn edit_list<F>(&self, id: &str, action: ActionType, edit: F) -> Result<List>
    where
        F: FnOnce(&mut List, Timestamp) -> Result<Value>,
    {
        let id = self.ids.resolve(id).await;
        let now = now_ms();
        let (_, list) = self
            .queue
            .enqueue_edit(&id, |local| {
                let mut list = local.ok_or_else(|| Error::NotFound(format!("list {id}")))?;
                let base_version = list.version;
                let payload = edit(&mut list, now)?;
                list.touch_local(now);
                let change = NewChange::new(action, id.clone(), payload, now, base_version);
                Ok((change, vec![StoreWrite::PutList(list.clone())], list))
            })
            .await?;

        tracing::debug!(entity_id = %list.id, action = %action.as_str(), "Local edit applied");
        self.emit(SyncEvent::EntityUpdated {
            list: list.clone(),
            origin: UpdateOrigin::Local,
        });
        Ok(list)
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("owner", &self.owner)
            .field("connection", &self.connection)
            .field("engine", &self.engine)
            .finish()
    }
}

fn to_payload(value: &impl Serialize) -> Result<Value> {
    Ok(serde_json::to_value(value).map_err(StoreError::from)?)
}

/// Writes pushed updates for subscribed lists to the store.
struct RemoteApplier {
    queue: Arc<PendingQueue>,
    ids: Arc<IdMap>,
    events: broadcast::Sender<SyncEvent>,
}

impl RemoteApplier {
    async fn run(self, mut updates: broadcast::Receiver<RemoteUpdate>, cancel: CancellationToken) {
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break,
                received = updates.recv() => match received {
                    Ok(update) => update,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Remote updates dropped, next drain will catch up");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            let entity_id = update.entity_id.clone();
            if let Err(e) = self.apply(update).await {
                tracing::warn!(entity_id = %entity_id, error = %e, "Remote update not applied");
            }
        }
    }

    /// Apply one push unless local edits for that list are still queued or
    /// the local copy is already newer.
    async fn apply(&self, update: RemoteUpdate) -> Result<()> {
        let id: EntityId = self.ids.resolve(&update.entity_id).await;
        let server = match &update.payload {
            Value::Null => None,
            payload => Some(List::from_value(payload)?),
        };

        let event = self
            .queue
            .update_list(&id, |local, outstanding| {
                if !outstanding.is_empty() {
                    return (Vec::new(), None);
                }
                match server {
                    None => match local {
                        Some(_) => (
                            vec![StoreWrite::DeleteList(id.clone())],
                            Some(SyncEvent::EntityDeleted { id: id.clone() }),
                        ),
                        None => (Vec::new(), None),
                    },
                    Some(server) => {
                        if local.is_some_and(|local| local.version > server.version) {
                            return (Vec::new(), None);
                        }
                        let list = List {
                            id: id.clone(),
                            local_revision: 0,
                            ..server
                        };
                        (
                            vec![StoreWrite::PutList(list.clone())],
                            Some(SyncEvent::EntityUpdated {
                                list,
                                origin: UpdateOrigin::Remote,
                            }),
                        )
                    }
                }
            })
            .await?;

        match event {
            Some(event) => {
                tracing::debug!(entity_id = %id, "Remote update applied");
                let _ = self.events.send(event);
            }
            None => tracing::debug!(entity_id = %id, "Remote update skipped"),
        }
        Ok(())
    }
}
