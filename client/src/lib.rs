//! # Listsync Client
//!
//! The async runtime around `listsync-engine`: it persists pending changes,
//! replays them against the remote API when the realtime connection is up,
//! reconciles temporary ids, resolves version conflicts and keeps a live
//! subscription channel for pushed updates.
//!
//! Every external collaborator is a capability trait:
//!
//! - [`DurableStore`]: lists, the pending-change log, id mappings and the
//!   conflict history ([`MemoryStore`], [`SqliteStore`])
//! - [`RemoteApi`]: the HTTP API ([`HttpRemoteApi`])
//! - [`RealtimeTransport`]: the push channel ([`WsTransport`])
//!
//! [`SyncClient`] wires them together and is the only type a UI layer needs.
//!
//! ## Lifecycle
//!
//! ```rust,no_run
//! use listsync_client::{
//!     AuthToken, ConnectionConfig, HttpRemoteApi, MemoryStore, SyncClient, SyncConfig,
//!     WsTransport,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> listsync_client::Result<()> {
//! let token = AuthToken::new("secret");
//! let api = HttpRemoteApi::new("https://api.example.com", token.clone(), &ConnectionConfig::default())?;
//! let transport = WsTransport::new("wss://rt.example.com/ws", "https://api.example.com/health");
//!
//! let mut client = SyncClient::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(api),
//!     Arc::new(transport),
//!     SyncConfig::default(),
//!     ConnectionConfig::default(),
//! );
//! client.start().await?;
//! client.connect(token);
//!
//! let list = client.create_list("Groceries").await?;
//! client.add_item(&list.id, "milk").await?;
//!
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod events;
pub mod mapping;
pub mod queue;
pub mod resolver;
pub mod store;
pub mod sync;
pub mod websocket;

pub use api::{ApiError, ApiRequest, ApiResult, ErrorClass, HttpRemoteApi, RemoteApi};
pub use auth::{AuthError, AuthToken, SharedToken};
pub use client::SyncClient;
pub use config::{Config, ConfigError, ConnectionConfig, SyncConfig};
pub use connection::{ConnectionHandle, ConnectionManager, RemoteUpdate};
pub use db::SqliteStore;
pub use error::{Error, Result, StoreError, TransportError};
pub use events::{DrainReport, SyncEvent, UpdateOrigin};
pub use mapping::IdMap;
pub use queue::{EnqueueOutcome, PendingQueue};
pub use resolver::ConflictResolver;
pub use store::{DurableStore, MemoryStore, StoreWrite};
pub use sync::SyncEngine;
pub use websocket::{
    ClientMessage, RealtimeTransport, ServerMessage, Session, SessionPeer, TransportEvent,
    WsTransport,
};

pub use listsync_engine as engine;

use listsync_engine::Timestamp;

/// Wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
