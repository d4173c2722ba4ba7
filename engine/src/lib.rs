//! # Listsync Engine
//!
//! The deterministic core of an offline-first list synchronization client.
//!
//! This crate holds every rule the sync runtime follows, with no knowledge of
//! storage, network, clocks or threads. The async runtime (`listsync-client`)
//! feeds it data and timestamps and acts on the decisions it returns.
//!
//! ## Design Principles
//!
//! - **No IO**: Time and randomness are passed in, never read
//! - **Deterministic**: Same inputs always produce same outputs
//! - **Testable**: Pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Lists and items
//!
//! A [`List`] is the synchronized entity. It carries a server-assigned
//! `version` used for optimistic concurrency, and a client-side
//! `local_revision` counting edits the server has not acknowledged yet.
//! Lists created offline get a temporary id (see [`new_temp_id`]) until the
//! server confirms them.
//!
//! ### Pending changes
//!
//! Every mutation becomes a [`PendingChange`]. Changes are grouped per entity
//! and replayed in a fixed [`ActionType`] priority order (see
//! [`group_changes`]), so a create always precedes the updates that depend
//! on it.
//!
//! ### Conflicts
//!
//! When the server rejects a write as stale, a [`ConflictStrategy`] merges
//! the two sides. [`ConflictStrategies::default`] registers the update merge
//! (newest item wins) and the delete resolution (unsynced local edits
//! survive a remote delete).
//!
//! ### Connection state
//!
//! [`ConnectionState`] is the realtime connection record. Its transition
//! methods decide, per [`DisconnectReason`], whether to stay down, schedule
//! a reconnect with [`BackoffPolicy`] or give up once the [`RetryBudgets`]
//! entry for that reason is spent.
//!
//! ## Quick Start
//!
//! ```rust
//! use listsync_engine::{group_changes, ActionType, PendingChange};
//! use serde_json::json;
//!
//! let changes = vec![
//!     PendingChange::new(2, ActionType::UpdateList, "temp-1", json!({"title": "b"}), 2000, 0),
//!     PendingChange::new(1, ActionType::CreateList, "temp-1", json!({"title": "a"}), 3000, 0),
//! ];
//!
//! let groups = group_changes(changes, |id| id.to_string());
//! assert_eq!(groups.len(), 1);
//! assert_eq!(groups[0].changes[0].action_type, ActionType::CreateList);
//! ```

pub mod change;
pub mod conflict;
pub mod connection;
pub mod error;
pub mod mapping;
pub mod model;
pub mod ordering;

pub use change::{
    ActionType, AddItemsPayload, ChangeStatus, DeleteItemPayload, NewChange, PendingChange,
    ReorderItemsPayload, SharePayload, UnsharePayload, UpdateItemPayload,
};
pub use conflict::{
    ConflictRecord, ConflictStrategies, ConflictStrategy, ConflictType, DeleteResolution,
    MergeOutcome, ResolutionStatus, UpdateMerge,
};
pub use connection::{
    BackoffPolicy, CloseDecision, ConnectionState, ConnectionStatus, DisconnectReason,
    RetryBudgets,
};
pub use error::Error;
pub use mapping::{sweep_candidates, IdMapping, MappingStatus};
pub use model::{is_temp_id, new_temp_id, Item, List, Permission, Share, TEMP_ID_PREFIX};
pub use ordering::{find_pending_add, group_changes, rewrite_pending_add, ChangeGroup, Rewrite};

/// Type aliases for clarity
pub type EntityId = String;
pub type ItemId = String;
pub type ChangeId = u64;
pub type Version = u64;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
