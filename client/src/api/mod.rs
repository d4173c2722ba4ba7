//! Remote API capability.
//!
//! The server exposes CRUD on lists plus item sub-resources, with versioned
//! writes: a write carrying a stale `baseVersion` is answered with HTTP 409
//! and a `{serverData, conflictType}` body.

mod http;

pub use http::HttpRemoteApi;

use crate::auth::AuthToken;
use async_trait::async_trait;
use listsync_engine::{
    error::Result as EngineResult, ActionType, AddItemsPayload, ConflictType, DeleteItemPayload,
    EntityId, Item, ItemId, List, PendingChange, ReorderItemsPayload, SharePayload,
    UnsharePayload, UpdateItemPayload, Version,
};
use serde_json::{Map, Value};

/// How the sync engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network drop, timeout, 5xx: retry later
    Transient,
    /// Version mismatch: resolve, then retry once
    Conflict,
    /// The request can never succeed as sent
    Permanent,
    /// Credentials rejected: stop syncing
    Fatal,
}

/// Remote API failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("Version conflict ({conflict_type})")]
    Conflict {
        server_data: Option<Value>,
        conflict_type: ConflictType,
    },

    #[error("Not found")]
    NotFound,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApiError::Conflict { .. } => ErrorClass::Conflict,
            ApiError::Unauthorized => ErrorClass::Fatal,
            ApiError::Server { .. } | ApiError::Network(_) | ApiError::Timeout => {
                ErrorClass::Transient
            }
            ApiError::NotFound | ApiError::Rejected { .. } | ApiError::InvalidResponse(_) => {
                ErrorClass::Permanent
            }
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// One write against the remote API.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiRequest {
    CreateList {
        list: List,
    },
    UpdateList {
        id: EntityId,
        patch: Map<String, Value>,
        base_version: Version,
    },
    DeleteList {
        id: EntityId,
        base_version: Version,
    },
    ShareList {
        id: EntityId,
        share: SharePayload,
        base_version: Version,
    },
    UnshareList {
        id: EntityId,
        user_ref: String,
        base_version: Version,
    },
    AddItems {
        list_id: EntityId,
        items: Vec<Item>,
        base_version: Version,
    },
    UpdateItem {
        list_id: EntityId,
        item_id: ItemId,
        changes: Map<String, Value>,
        base_version: Version,
    },
    DeleteItem {
        list_id: EntityId,
        item_id: ItemId,
        base_version: Version,
    },
    ReorderItems {
        list_id: EntityId,
        item_ids: Vec<ItemId>,
        base_version: Version,
    },
}

impl ApiRequest {
    /// Build the request replaying `change` against `target_id`.
    pub fn from_change(
        change: &PendingChange,
        target_id: &str,
        base_version: Version,
    ) -> EngineResult<Self> {
        let id = target_id.to_string();
        let request = match change.action_type {
            ActionType::CreateList => ApiRequest::CreateList {
                list: List::from_value(&change.payload)?,
            },
            ActionType::UpdateList => ApiRequest::UpdateList {
                id,
                patch: change.patch()?.clone(),
                base_version,
            },
            ActionType::DeleteList => ApiRequest::DeleteList { id, base_version },
            ActionType::ShareList => ApiRequest::ShareList {
                id,
                share: change.decode()?,
                base_version,
            },
            ActionType::UnshareList => {
                let payload: UnsharePayload = change.decode()?;
                ApiRequest::UnshareList {
                    id,
                    user_ref: payload.user_ref,
                    base_version,
                }
            }
            ActionType::AddItem => {
                let payload: AddItemsPayload = change.decode()?;
                ApiRequest::AddItems {
                    list_id: id,
                    items: payload.items,
                    base_version,
                }
            }
            ActionType::UpdateItem => {
                let payload: UpdateItemPayload = change.decode()?;
                ApiRequest::UpdateItem {
                    list_id: id,
                    item_id: payload.item_id,
                    changes: payload.changes,
                    base_version,
                }
            }
            ActionType::DeleteItem => {
                let payload: DeleteItemPayload = change.decode()?;
                ApiRequest::DeleteItem {
                    list_id: id,
                    item_id: payload.item_id,
                    base_version,
                }
            }
            ActionType::ReorderItem => {
                let payload: ReorderItemsPayload = change.decode()?;
                ApiRequest::ReorderItems {
                    list_id: id,
                    item_ids: payload.item_ids,
                    base_version,
                }
            }
        };
        Ok(request)
    }

    /// Full-state update carrying a merged list.
    pub fn replace_list(list: &List) -> Self {
        let mut patch = Map::new();
        patch.insert("title".into(), Value::String(list.title.clone()));
        patch.insert(
            "items".into(),
            serde_json::to_value(&list.items).unwrap_or(Value::Array(Vec::new())),
        );
        patch.insert(
            "sharedWith".into(),
            serde_json::to_value(&list.shared_with).unwrap_or(Value::Array(Vec::new())),
        );
        ApiRequest::UpdateList {
            id: list.id.clone(),
            patch,
            base_version: list.version,
        }
    }

    /// The same request against a different base version.
    pub fn with_base_version(mut self, version: Version) -> Self {
        match &mut self {
            ApiRequest::CreateList { .. } => {}
            ApiRequest::UpdateList { base_version, .. }
            | ApiRequest::DeleteList { base_version, .. }
            | ApiRequest::ShareList { base_version, .. }
            | ApiRequest::UnshareList { base_version, .. }
            | ApiRequest::AddItems { base_version, .. }
            | ApiRequest::UpdateItem { base_version, .. }
            | ApiRequest::DeleteItem { base_version, .. }
            | ApiRequest::ReorderItems { base_version, .. } => *base_version = version,
        }
        self
    }

    pub fn base_version(&self) -> Option<Version> {
        match self {
            ApiRequest::CreateList { .. } => None,
            ApiRequest::UpdateList { base_version, .. }
            | ApiRequest::DeleteList { base_version, .. }
            | ApiRequest::ShareList { base_version, .. }
            | ApiRequest::UnshareList { base_version, .. }
            | ApiRequest::AddItems { base_version, .. }
            | ApiRequest::UpdateItem { base_version, .. }
            | ApiRequest::DeleteItem { base_version, .. }
            | ApiRequest::ReorderItems { base_version, .. } => Some(*base_version),
        }
    }
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Perform a write. Returns the server copy of the list, or `None` when
    /// the list no longer exists (a successful delete).
    async fn execute(&self, request: &ApiRequest) -> ApiResult<Option<List>>;

    async fn fetch_list(&self, id: &str) -> ApiResult<List>;

    /// Lightweight liveness check.
    async fn health(&self) -> ApiResult<()>;

    /// Use `token` for every request from now on.
    fn set_token(&self, _token: &AuthToken) {}
}
