//! Outbound notifications for the UI layer.

use listsync_engine::{ChangeId, EntityId, List};

/// Where an entity update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// An optimistic local edit
    Local,
    /// Our own change was acknowledged by the server
    Sync,
    /// Another client's change, pushed over the realtime channel
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    EntityUpdated { list: List, origin: UpdateOrigin },
    EntityDeleted { id: EntityId },
    /// A list created offline now has its server id
    IdReconciled { temp_id: EntityId, actual_id: EntityId },
    /// Changes that need an explicit retry or discard
    ChangesFailed {
        entity_id: EntityId,
        change_ids: Vec<ChangeId>,
        error: String,
    },
    DrainCompleted(DrainReport),
}

/// Summary of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Changes acknowledged and removed from the queue
    pub applied: usize,
    /// Changes marked failed during this drain
    pub failed: usize,
    /// Changes left pending for a later drain
    pub deferred: usize,
    /// Entity groups visited
    pub groups: usize,
    /// Another drain was already running; nothing was done
    pub skipped: bool,
}

impl DrainReport {
    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub(crate) fn absorb(&mut self, other: &DrainReport) {
        self.applied += other.applied;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.groups += other.groups;
    }
}
