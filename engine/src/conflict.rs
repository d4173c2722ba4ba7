//! Conflict resolution for writes the server rejected as stale.
//!
//! A conflict has a [`ConflictType`] chosen by the server. Each type maps to
//! a [`ConflictStrategy`] in a [`ConflictStrategies`] registry. Strategies
//! are pure: they see the local copy and whatever the server reported, and
//! return a [`MergeOutcome`].
//!
//! Item merging is heuristic. For an item present on both sides the newer
//! `updatedAt` wins; there is no causal tracking, so concurrent edits to the
//! same field from two offline devices look like sequential ones.

use crate::{error::Result, Error, List, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Why the server rejected a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConflictType {
    /// Concurrent edit: the base version is stale
    Update,
    /// The entity was removed server-side
    Delete,
}

impl ConflictType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictType::Update => "UPDATE",
            ConflictType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UPDATE" => Ok(ConflictType::Update),
            "DELETE" => Ok(ConflictType::Delete),
            other => Err(Error::ResolutionFailed(format!("unknown conflict type {other}"))),
        }
    }
}

/// How a conflict ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    Auto,
    Failed,
}

impl ResolutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionStatus::Auto => "auto",
            ResolutionStatus::Failed => "failed",
        }
    }
}

impl FromStr for ResolutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(ResolutionStatus::Auto),
            "failed" => Ok(ResolutionStatus::Failed),
            other => Err(Error::ResolutionFailed(format!("unknown resolution {other}"))),
        }
    }
}

/// One entry in the append-only conflict history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub local_data: Value,
    pub server_data: Value,
    pub timestamp: Timestamp,
    pub resolution: ResolutionStatus,
    pub metadata: Value,
}

/// Result of resolving a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Write this merged entity back (it carries the server's version)
    Merged(List),
    /// Local wins over a remote delete; send it again as a fresh create
    Recreate(List),
    /// The server's delete stands; drop the local copy
    Deleted,
}

/// A merge policy for one conflict type.
pub trait ConflictStrategy: Send + Sync {
    /// Resolve `local` against what the server reported (`None` when the
    /// server sent no entity, e.g. a delete tombstone without a body).
    fn resolve(&self, local: &List, server: Option<&List>) -> Result<MergeOutcome>;
}

/// Merge items by id, newest `updatedAt` wins; adopt the server's version.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateMerge;

impl ConflictStrategy for UpdateMerge {
    fn resolve(&self, local: &List, server: Option<&List>) -> Result<MergeOutcome> {
        let server = server.ok_or_else(|| {
            Error::ResolutionFailed(format!(
                "update conflict on {} carried no server state",
                local.id
            ))
        })?;

        let mut items = Vec::with_capacity(server.items.len().max(local.items.len()));
        for server_item in &server.items {
            match local.item(&server_item.id) {
                Some(local_item) if local_item.updated_at > server_item.updated_at => {
                    items.push(local_item.clone())
                }
                _ => items.push(server_item.clone()),
            }
        }
        for local_item in &local.items {
            if server.item(&local_item.id).is_none() {
                items.push(local_item.clone());
            }
        }
        items.sort_by_key(|item| item.position);

        let local_is_newer = local.updated_at > server.updated_at;
        let merged = List {
            id: server.id.clone(),
            title: if local_is_newer {
                local.title.clone()
            } else {
                server.title.clone()
            },
            items,
            owner: if server.owner.is_empty() {
                local.owner.clone()
            } else {
                server.owner.clone()
            },
            shared_with: server.shared_with.clone(),
            version: server.version,
            updated_at: local.updated_at.max(server.updated_at),
            local_revision: local.local_revision,
        };

        merged
            .validate()
            .map_err(|e| Error::ResolutionFailed(format!("merged entity rejected: {e}")))?;
        Ok(MergeOutcome::Merged(merged))
    }
}

/// Unsynced local edits survive a remote delete; otherwise the higher version wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteResolution;

impl ConflictStrategy for DeleteResolution {
    fn resolve(&self, local: &List, server: Option<&List>) -> Result<MergeOutcome> {
        local
            .validate()
            .map_err(|e| Error::ResolutionFailed(format!("local entity rejected: {e}")))?;

        if local.local_revision > 0 {
            return Ok(MergeOutcome::Recreate(local.clone()));
        }
        match server {
            Some(server) if local.version > server.version => {
                Ok(MergeOutcome::Recreate(local.clone()))
            }
            _ => Ok(MergeOutcome::Deleted),
        }
    }
}

/// Registry of strategies keyed by conflict type.
pub struct ConflictStrategies {
    strategies: HashMap<ConflictType, Box<dyn ConflictStrategy>>,
}

impl ConflictStrategies {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Register (or replace) the strategy for a conflict type.
    pub fn register(
        &mut self,
        conflict_type: ConflictType,
        strategy: impl ConflictStrategy + 'static,
    ) -> &mut Self {
        self.strategies.insert(conflict_type, Box::new(strategy));
        self
    }

    /// Resolve with the strategy registered for `conflict_type`.
    pub fn resolve(
        &self,
        local: &List,
        server: Option<&List>,
        conflict_type: ConflictType,
    ) -> Result<MergeOutcome> {
        let strategy = self.strategies.get(&conflict_type).ok_or_else(|| {
            Error::ResolutionFailed(format!("no strategy registered for {conflict_type}"))
        })?;
        strategy.resolve(local, server)
    }
}

impl Default for ConflictStrategies {
    fn default() -> Self {
        let mut strategies = Self::empty();
        strategies
            .register(ConflictType::Update, UpdateMerge)
            .register(ConflictType::Delete, DeleteResolution);
        strategies
    }
}

impl fmt::Debug for ConflictStrategies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictStrategies")
            .field("types", &self.strategies.keys().collect::<Vec<_>>())
            .finish()
    }
}
