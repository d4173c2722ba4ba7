//! End-to-end replay tests against an in-process fake server.

use async_trait::async_trait;
use listsync_client::{
    ApiError, ApiRequest, ApiResult, AuthToken, ConflictResolver, ConnectionConfig,
    ConnectionHandle, ConnectionManager, DurableStore, IdMap, MemoryStore, PendingQueue,
    RealtimeTransport, RemoteApi, ServerMessage, Session, SessionPeer, SyncClient, SyncConfig,
    SyncEngine, SyncEvent, TransportError, TransportEvent, UpdateOrigin,
};
use listsync_engine::{ActionType, ConflictType, ConnectionStatus, Item, List, Share};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Versioned list server: every accepted write bumps the version, a stale
/// base version is answered with a conflict carrying the current state.
#[derive(Default)]
struct FakeServer {
    lists: Mutex<HashMap<String, List>>,
    created: AtomicUsize,
    requests: Mutex<Vec<ApiRequest>>,
    failures: Mutex<VecDeque<ApiError>>,
    delay: Option<Duration>,
    /// Only this bearer is accepted when set
    accepted_token: Option<String>,
    token: Mutex<Option<String>>,
}

impl FakeServer {
    fn with_list(self, list: List) -> Self {
        self.lists.lock().unwrap().insert(list.id.clone(), list);
        self
    }

    fn accepting(mut self, token: &str) -> Self {
        self.accepted_token = Some(token.to_string());
        self
    }

    fn fail_next(&self, error: ApiError) {
        self.failures.lock().unwrap().push_back(error);
    }

    fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn list(&self, id: &str) -> Option<List> {
        self.lists.lock().unwrap().get(id).cloned()
    }
}

fn target(request: &ApiRequest) -> &str {
    match request {
        ApiRequest::CreateList { list } => &list.id,
        ApiRequest::UpdateList { id, .. }
        | ApiRequest::DeleteList { id, .. }
        | ApiRequest::ShareList { id, .. }
        | ApiRequest::UnshareList { id, .. } => id,
        ApiRequest::AddItems { list_id, .. }
        | ApiRequest::UpdateItem { list_id, .. }
        | ApiRequest::DeleteItem { list_id, .. }
        | ApiRequest::ReorderItems { list_id, .. } => list_id,
    }
}

fn conflict(current: &List) -> ApiError {
    ApiError::Conflict {
        server_data: Some(serde_json::to_value(current).unwrap()),
        conflict_type: ConflictType::Update,
    }
}

fn apply(list: &mut List, request: &ApiRequest) {
    match request {
        ApiRequest::UpdateList { patch, .. } => list.apply_patch(patch, 0).unwrap(),
        ApiRequest::ShareList { share, .. } => list.share(
            Share {
                user_ref: share.user_ref.clone(),
                permission: share.permission,
            },
            0,
        ),
        ApiRequest::UnshareList { user_ref, .. } => list.unshare(user_ref, 0),
        ApiRequest::AddItems { items, .. } => list.add_items(items, 0),
        ApiRequest::UpdateItem {
            item_id, changes, ..
        } => list.update_item(item_id, changes, 0).unwrap(),
        ApiRequest::DeleteItem { item_id, .. } => list.remove_item(item_id, 0).unwrap(),
        ApiRequest::ReorderItems { item_ids, .. } => list.reorder_items(item_ids, 0),
        ApiRequest::CreateList { .. } | ApiRequest::DeleteList { .. } => {}
    }
}

#[async_trait]
impl RemoteApi for FakeServer {
    async fn execute(&self, request: &ApiRequest) -> ApiResult<Option<List>> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(accepted) = &self.accepted_token {
            if self.token.lock().unwrap().as_deref() != Some(accepted.as_str()) {
                return Err(ApiError::Unauthorized);
            }
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let mut lists = self.lists.lock().unwrap();
        if let ApiRequest::CreateList { list } = request {
            let id = format!("srv-{}", self.created.fetch_add(1, Ordering::SeqCst) + 1);
            let created = List {
                id: id.clone(),
                version: 1,
                local_revision: 0,
                ..list.clone()
            };
            lists.insert(id, created.clone());
            return Ok(Some(created));
        }

        let id = target(request).to_string();
        let current = lists.get_mut(&id).ok_or(ApiError::NotFound)?;
        if request.base_version() != Some(current.version) {
            return Err(conflict(current));
        }
        if matches!(request, ApiRequest::DeleteList { .. }) {
            lists.remove(&id);
            return Ok(None);
        }
        apply(current, request);
        current.version += 1;
        Ok(Some(current.clone()))
    }

    async fn fetch_list(&self, id: &str) -> ApiResult<List> {
        self.list(id).ok_or(ApiError::NotFound)
    }

    async fn health(&self) -> ApiResult<()> {
        Ok(())
    }

    fn set_token(&self, token: &AuthToken) {
        *self.token.lock().unwrap() = Some(token.secret().to_string());
    }
}

/// Every open succeeds; peers are kept so sessions stay up.
#[derive(Default)]
struct FakeTransport {
    peers: Mutex<Vec<SessionPeer>>,
}

impl FakeTransport {
    fn push(&self, message: ServerMessage) {
        let peers = self.peers.lock().unwrap();
        peers
            .last()
            .unwrap()
            .events
            .send(TransportEvent::Message(message))
            .unwrap();
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn open(&self, _token: &AuthToken) -> Result<Session, TransportError> {
        let (session, peer) = Session::channel();
        self.peers.lock().unwrap().push(peer);
        Ok(session)
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    server: Arc<FakeServer>,
    queue: Arc<PendingQueue>,
    ids: Arc<IdMap>,
    resolver: Arc<ConflictResolver>,
    engine: SyncEngine,
    manager: ConnectionManager,
    handle: ConnectionHandle,
}

impl Harness {
    fn new(server: FakeServer, config: SyncConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let server = Arc::new(server);
        let ids = Arc::new(IdMap::new(store.clone(), config.mapping_ttl));
        let queue = Arc::new(PendingQueue::new(store.clone(), ids.clone()));
        let resolver = Arc::new(ConflictResolver::new(server.clone(), store.clone(), &config));
        let mut manager = ConnectionManager::new(
            ConnectionConfig::default().with_max_jitter(Duration::ZERO),
            Arc::new(FakeTransport::default()),
        );
        manager.start();
        let handle = manager.handle();
        let engine = SyncEngine::new(
            store.clone(),
            server.clone(),
            queue.clone(),
            ids.clone(),
            resolver.clone(),
            handle.clone(),
            config.with_batch(10, Duration::ZERO),
        );
        Self {
            store,
            server,
            queue,
            ids,
            resolver,
            engine,
            manager,
            handle,
        }
    }

    async fn online(&self) {
        self.handle.connect(AuthToken::new("token"));
        let mut status = self.handle.subscribe_status();
        status
            .wait_for(|state| state.status == ConnectionStatus::Connected)
            .await
            .unwrap();
    }

    async fn local(&self, list: List) {
        self.store.put_list(&list).await.unwrap();
    }

    async fn queue(&self, action: ActionType, id: &str, payload: Value, base: u64) {
        self.queue.enqueue(action, id, payload, base).await.unwrap();
    }

    async fn shutdown(mut self) {
        self.manager.stop().await;
    }
}

fn server_list(id: &str, version: u64) -> List {
    let mut list = List::new(id, "Groceries", "me", 1);
    list.version = version;
    list
}

fn items(items: &[Item]) -> Value {
    json!({ "items": items })
}

#[tokio::test]
async fn create_then_updates_replay_under_server_id() {
    let h = Harness::new(FakeServer::default(), SyncConfig::default());
    h.online().await;

    let mut local = List::new("temp-1", "Groceries", "me", 1);
    local.local_revision = 3;
    h.local(local).await;
    h.queue(ActionType::AddItem, "temp-1", items(&[Item::new("i1", "milk", 0, 2)]), 0)
        .await;
    h.queue(ActionType::UpdateList, "temp-1", json!({"title": "Weekly"}), 0)
        .await;
    h.queue(
        ActionType::CreateList,
        "temp-1",
        json!({"id": "temp-1", "title": "Groceries", "owner": "me"}),
        0,
    )
    .await;

    let report = h.engine.process_pending_changes().await.unwrap();
    assert_eq!(report.applied, 3);
    assert_eq!(report.failed, 0);

    let requests = h.server.requests();
    assert!(matches!(requests[0], ApiRequest::CreateList { .. }));
    assert!(matches!(requests[1], ApiRequest::UpdateList { ref id, base_version: 1, .. } if id == "srv-1"));
    assert!(matches!(requests[2], ApiRequest::AddItems { ref list_id, base_version: 2, .. } if list_id == "srv-1"));

    assert!(h.store.get_list("temp-1").await.unwrap().is_none());
    let stored = h.store.get_list("srv-1").await.unwrap().unwrap();
    assert_eq!(stored.title, "Weekly");
    assert_eq!(stored.version, 3);
    assert_eq!(stored.local_revision, 0);
    assert_eq!(h.ids.resolve("temp-1").await, "srv-1");
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    h.shutdown().await;
}

#[tokio::test]
async fn permanent_failure_halts_only_its_group() {
    let h = Harness::new(
        FakeServer::default()
            .with_list(server_list("srv-1", 1))
            .with_list(server_list("srv-2", 1)),
        SyncConfig::default().with_workers(1),
    );
    h.online().await;
    h.local(server_list("srv-1", 1)).await;
    h.local(server_list("srv-2", 1)).await;
    let mut events = h.engine.subscribe();

    h.queue(ActionType::UpdateList, "srv-1", json!({"title": "a"}), 1).await;
    h.queue(ActionType::AddItem, "srv-1", items(&[Item::new("i1", "milk", 0, 3)]), 1)
        .await;
    h.queue(ActionType::UpdateList, "srv-2", json!({"title": "b"}), 1).await;
    h.server.fail_next(ApiError::Rejected {
        status: 400,
        message: "bad title".into(),
    });

    let report = h.engine.process_pending_changes().await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(report.applied, 1);
    assert_eq!(h.queue.failed().await.unwrap().len(), 2);
    assert_eq!(h.server.list("srv-2").unwrap().title, "b");

    let failed = loop {
        match events.recv().await.unwrap() {
            SyncEvent::ChangesFailed {
                entity_id,
                change_ids,
                ..
            } => break (entity_id, change_ids),
            _ => continue,
        }
    };
    assert_eq!(failed.0, "srv-1");
    assert_eq!(failed.1.len(), 2);

    // failed changes stay put until the operator acts
    let report = h.engine.process_pending_changes().await.unwrap();
    assert_eq!(report.applied, 0);
    for id in failed.1 {
        h.queue.retry_failed(id).await.unwrap();
    }
    let report = h.engine.process_pending_changes().await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(h.server.list("srv-1").unwrap().items.len(), 1);
    h.shutdown().await;
}

fn busy() -> ApiError {
    ApiError::Server {
        status: 503,
        message: "busy".into(),
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_before_spending_the_budget() {
    let h = Harness::new(
        FakeServer::default().with_list(server_list("srv-1", 1)),
        SyncConfig::default().with_max_retries(3).with_retry_backoff(
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::ZERO,
        ),
    );
    h.online().await;
    h.local(server_list("srv-1", 1)).await;
    h.queue(ActionType::UpdateList, "srv-1", json!({"title": "a"}), 1).await;
    for _ in 0..3 {
        h.server.fail_next(busy());
    }

    // drains right after a failure leave the change alone
    for _ in 0..3 {
        let report = h.engine.process_pending_changes().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.failed, 0);
    }
    assert_eq!(h.server.requests().len(), 1);
    assert_eq!(h.queue.list_pending().await.unwrap()[0].retries, 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let report = h.engine.process_pending_changes().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(h.server.requests().len(), 2);

    // the second wait doubles
    tokio::time::sleep(Duration::from_millis(1500)).await;
    h.engine.process_pending_changes().await.unwrap();
    assert_eq!(h.server.requests().len(), 2);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let report = h.engine.process_pending_changes().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.server.requests().len(), 3);
    assert_eq!(h.queue.failed().await.unwrap().len(), 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn backed_off_change_is_retried_by_the_scheduler() {
    let mut h = Harness::new(
        FakeServer::default().with_list(server_list("srv-1", 1)),
        SyncConfig::default()
            .with_interval(Duration::from_secs(3600))
            .with_retry_backoff(Duration::from_secs(2), Duration::from_secs(10), Duration::ZERO),
    );
    h.online().await;
    h.local(server_list("srv-1", 1)).await;
    h.server.fail_next(busy());
    h.engine.start();

    h.queue(ActionType::UpdateList, "srv-1", json!({"title": "a"}), 1).await;
    let server = h.server.clone();
    wait_until(|| {
        let server = server.clone();
        async move { server.list("srv-1").unwrap().title == "a" }
    })
    .await;
    assert_eq!(h.server.requests().len(), 2);
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    h.engine.stop().await;
    h.shutdown().await;
}

#[tokio::test]
async fn stale_write_is_merged_and_retried_once() {
    let mut remote = server_list("srv-1", 3);
    remote.items.push(Item::new("i1", "milk", 0, 10));
    let h = Harness::new(FakeServer::default().with_list(remote), SyncConfig::default());
    h.online().await;

    let eggs = Item::new("i2", "eggs", 1, 20);
    let mut local = server_list("srv-1", 1);
    local.items.push(eggs.clone());
    local.local_revision = 1;
    h.local(local).await;
    h.queue(ActionType::AddItem, "srv-1", items(&[eggs]), 1).await;

    let report = h.engine.process_pending_changes().await.unwrap();
    assert_eq!(report.applied, 1);

    let requests = h.server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].base_version(), Some(3));

    let server = h.server.list("srv-1").unwrap();
    assert_eq!(server.version, 4);
    assert_eq!(server.items.len(), 2);
    let stored = h.store.get_list("srv-1").await.unwrap().unwrap();
    assert_eq!(stored.version, 4);
    assert_eq!(stored.local_revision, 0);
    assert_eq!(h.resolver.buffered(), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn second_conflict_marks_change_failed() {
    let remote = server_list("srv-1", 3);
    let h = Harness::new(
        FakeServer::default().with_list(remote.clone()),
        SyncConfig::default(),
    );
    h.online().await;
    h.local(server_list("srv-1", 1)).await;
    h.queue(ActionType::UpdateList, "srv-1", json!({"title": "a"}), 1).await;
    h.server.fail_next(conflict(&remote));
    h.server.fail_next(conflict(&remote));

    let report = h.engine.process_pending_changes().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.server.requests().len(), 2);
    h.shutdown().await;
}

#[tokio::test]
async fn deleting_a_missing_list_counts_as_done() {
    let h = Harness::new(FakeServer::default(), SyncConfig::default());
    h.online().await;
    h.queue(ActionType::DeleteList, "srv-9", Value::Null, 2).await;

    let report = h.engine.process_pending_changes().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    h.shutdown().await;
}

#[tokio::test]
async fn offline_drain_sends_nothing() {
    let h = Harness::new(FakeServer::default(), SyncConfig::default());
    h.queue(ActionType::DeleteList, "srv-9", Value::Null, 2).await;

    let report = h.engine.process_pending_changes().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert!(h.server.requests().is_empty());
    h.shutdown().await;
}

#[tokio::test]
async fn concurrent_drains_run_once() {
    let h = Harness::new(
        FakeServer {
            delay: Some(Duration::from_millis(100)),
            ..FakeServer::default()
        }
        .with_list(server_list("srv-1", 1)),
        SyncConfig::default(),
    );
    h.online().await;
    h.local(server_list("srv-1", 1)).await;
    h.queue(ActionType::UpdateList, "srv-1", json!({"title": "a"}), 1).await;

    let (first, second) = tokio::join!(
        h.engine.process_pending_changes(),
        h.engine.process_pending_changes()
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(first.skipped != second.skipped);
    assert_eq!(first.applied + second.applied, 1);
    assert_eq!(h.server.requests().len(), 1);
    h.shutdown().await;
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn offline_edits_sync_after_connect() {
    let server = Arc::new(FakeServer::default());
    let transport = Arc::new(FakeTransport::default());
    let mut client = SyncClient::new(
        Arc::new(MemoryStore::new()),
        server.clone(),
        transport,
        SyncConfig::default().with_batch(10, Duration::ZERO),
        ConnectionConfig::default().with_max_jitter(Duration::ZERO),
    )
    .with_owner("me");
    client.start().await.unwrap();
    let mut events = client.subscribe();

    let list = client.create_list("Groceries").await.unwrap();
    assert!(list.is_temp());
    let item = client.add_item(&list.id, "milk").await.unwrap();
    let mut changes = serde_json::Map::new();
    changes.insert("text".into(), json!("oat milk"));
    client.update_item(&list.id, &item.id, changes).await.unwrap();
    // the item edit folded into the pending add
    assert_eq!(client.pending_change_count().await.unwrap(), 2);

    client.connect(AuthToken::new("token"));
    let actual_id = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SyncEvent::IdReconciled { temp_id, actual_id }) = events.recv().await {
                assert_eq!(temp_id, list.id);
                break actual_id;
            }
        }
    })
    .await
    .unwrap();
    let reader = &client;
    wait_until(|| async move { reader.pending_change_count().await.unwrap() == 0 }).await;

    let synced = client.list(&list.id).await.unwrap().unwrap();
    assert_eq!(synced.id, actual_id);
    assert_eq!(synced.items[0].text, "oat milk");
    assert_eq!(synced.local_revision, 0);
    assert_eq!(server.list(&actual_id).unwrap().items[0].text, "oat milk");
    assert_eq!(client.lists().await.unwrap().len(), 1);
    client.stop().await;
}

#[tokio::test]
async fn pushed_update_replaces_local_copy() {
    let store = Arc::new(MemoryStore::new());
    store.put_list(&server_list("srv-1", 1)).await.unwrap();
    let transport = Arc::new(FakeTransport::default());
    let mut client = SyncClient::new(
        store.clone(),
        Arc::new(FakeServer::default()),
        transport.clone(),
        SyncConfig::default(),
        ConnectionConfig::default(),
    );
    client.start().await.unwrap();
    let mut events = client.subscribe();
    client.connect(AuthToken::new("token"));
    let mut status = client.connection().subscribe_status();
    status
        .wait_for(|state| state.status == ConnectionStatus::Connected)
        .await
        .unwrap();

    let mut pushed = server_list("srv-1", 5);
    pushed.title = "Renamed elsewhere".into();
    transport.push(ServerMessage::EntityUpdated {
        entity_type: "list".into(),
        entity_id: "srv-1".into(),
        payload: serde_json::to_value(&pushed).unwrap(),
    });

    let list = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SyncEvent::EntityUpdated {
                list,
                origin: UpdateOrigin::Remote,
            }) = events.recv().await
            {
                break list;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(list.version, 5);
    assert_eq!(store.get_list("srv-1").await.unwrap().unwrap().title, "Renamed elsewhere");

    client.stop().await;
}

#[tokio::test]
async fn reauthentication_resumes_halted_sync() {
    let server = Arc::new(
        FakeServer::default()
            .with_list(server_list("srv-1", 1))
            .accepting("fresh"),
    );
    let store = Arc::new(MemoryStore::new());
    store.put_list(&server_list("srv-1", 1)).await.unwrap();
    let mut client = SyncClient::new(
        store,
        server.clone(),
        Arc::new(FakeTransport::default()),
        SyncConfig::default().with_batch(10, Duration::ZERO),
        ConnectionConfig::default().with_max_jitter(Duration::ZERO),
    );
    client.start().await.unwrap();
    let mut status = client.connection().subscribe_status();

    client.connect(AuthToken::new("expired"));
    let mut patch = serde_json::Map::new();
    patch.insert("title".into(), json!("Weekly"));
    client.update_list("srv-1", patch).await.unwrap();

    // the rejected bearer halts sync without failing the change
    status
        .wait_for(|state| state.status == ConnectionStatus::Error)
        .await
        .unwrap();
    assert_eq!(client.pending_change_count().await.unwrap(), 1);
    assert!(client.failed_changes().await.unwrap().is_empty());
    assert_eq!(server.list("srv-1").unwrap().title, "Groceries");

    client.connect(AuthToken::new("fresh"));
    let reader = &client;
    wait_until(|| async move { reader.pending_change_count().await.unwrap() == 0 }).await;
    assert_eq!(server.list("srv-1").unwrap().title, "Weekly");
    assert_eq!(client.connection_status(), ConnectionStatus::Connected);
    client.stop().await;
}

#[tokio::test]
async fn mapping_outlives_ttl_while_a_failed_change_uses_the_temp_id() {
    let h = Harness::new(
        FakeServer::default(),
        SyncConfig::default().with_mapping_ttl(Duration::ZERO),
    );
    h.online().await;
    h.local(List::new("temp-1", "Groceries", "me", 1)).await;
    h.queue(
        ActionType::CreateList,
        "temp-1",
        json!({"id": "temp-1", "title": "Groceries", "owner": "me"}),
        0,
    )
    .await;
    h.engine.process_pending_changes().await.unwrap();
    assert_eq!(h.ids.resolve("temp-1").await, "srv-1");

    h.queue(ActionType::UpdateList, "temp-1", json!({"title": "x"}), 0).await;
    h.server.fail_next(ApiError::Rejected {
        status: 422,
        message: "title too short".into(),
    });
    let report = h.engine.process_pending_changes().await.unwrap();
    assert_eq!(report.failed, 1);
    let failed = h.queue.failed().await.unwrap();
    assert_eq!(failed[0].entity_id, "temp-1");

    // past the ttl, the failed change still pins the mapping
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.engine.sweep().await.unwrap();
    assert!(h.store.get_mapping("temp-1").await.unwrap().is_some());
    assert_eq!(h.ids.resolve("temp-1").await, "srv-1");

    h.queue.discard_failed(failed[0].id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.engine.sweep().await.unwrap();
    assert!(h.store.get_mapping("temp-1").await.unwrap().is_none());
    h.shutdown().await;
}
