//! Temporary-to-server id mappings and their garbage-collection rule.

use crate::{error::Result, EntityId, Error, PendingChange, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

/// Status of an id mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    Pending,
    Completed,
    Failed,
}

impl MappingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MappingStatus::Pending => "pending",
            MappingStatus::Completed => "completed",
            MappingStatus::Failed => "failed",
        }
    }
}

impl FromStr for MappingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MappingStatus::Pending),
            "completed" => Ok(MappingStatus::Completed),
            "failed" => Ok(MappingStatus::Failed),
            other => Err(Error::InvalidEntity(format!("unknown mapping status {other}"))),
        }
    }
}

/// Links a locally generated id to the id the server assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    pub temp_id: EntityId,
    pub actual_id: EntityId,
    pub status: MappingStatus,
    pub created_at: Timestamp,
}

impl IdMapping {
    pub fn new(
        temp_id: impl Into<EntityId>,
        actual_id: impl Into<EntityId>,
        status: MappingStatus,
        created_at: Timestamp,
    ) -> Self {
        Self {
            temp_id: temp_id.into(),
            actual_id: actual_id.into(),
            status,
            created_at,
        }
    }

    /// Whether `id` is either side of this mapping.
    pub fn covers(&self, id: &str) -> bool {
        self.temp_id == id || self.actual_id == id
    }

    /// Whether the mapping is older than `ttl` at `now`.
    pub fn is_expired(&self, now: Timestamp, ttl: Duration) -> bool {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        now.saturating_sub(self.created_at) > ttl_ms
    }
}

/// Mappings that may be removed at `now`.
///
/// A mapping is removable only when it is simultaneously older than `ttl`,
/// not `pending`, and not the entity of any outstanding change (pending or
/// failed). A referenced mapping is kept no matter how old it is, and so is
/// every later link of the chain it starts (`temp-1 -> srv-1 -> srv-2`).
pub fn sweep_candidates<'a>(
    mappings: &'a [IdMapping],
    changes: &[PendingChange],
    now: Timestamp,
    ttl: Duration,
) -> Vec<&'a IdMapping> {
    let forward: HashMap<&str, &str> = mappings
        .iter()
        .map(|m| (m.temp_id.as_str(), m.actual_id.as_str()))
        .collect();
    let mut referenced: HashSet<&str> = HashSet::new();
    for change in changes {
        let mut current = change.entity_id.as_str();
        while referenced.insert(current) {
            match forward.get(current) {
                Some(next) => current = *next,
                None => break,
            }
        }
    }

    mappings
        .iter()
        .filter(|m| m.status != MappingStatus::Pending)
        .filter(|m| m.is_expired(now, ttl))
        .filter(|m| {
            !referenced.contains(m.temp_id.as_str()) && !referenced.contains(m.actual_id.as_str())
        })
        .collect()
}
