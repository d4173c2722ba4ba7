//! Drain triggers and the maintenance sweeper.
//!
//! A drain starts on the periodic tick, when a change is queued, when the
//! connection comes back and when a backed-off change becomes due. Every
//! trigger is gated on connectivity.

use super::EngineCore;
use listsync_engine::ConnectionStatus;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Background tasks of a running [`super::SyncEngine`].
pub struct SyncScheduler {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncScheduler {
    pub(crate) fn start(core: Arc<EngineCore>) -> Self {
        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(run_triggers(core.clone(), cancel.clone())),
            tokio::spawn(run_sweeper(core, cancel.clone())),
        ];
        Self { cancel, tasks }
    }

    /// Cancel both tasks. An in-progress drain is abandoned at its next
    /// await point; its changes stay queued.
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("Sync task ended abnormally: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

async fn run_triggers(core: Arc<EngineCore>, cancel: CancellationToken) {
    let notify = core.queue.notifier();
    let mut status = core.connection.subscribe_status();
    let mut was_connected = status.borrow().status == ConnectionStatus::Connected;
    let mut watching = true;
    // a deadline fires once; a drain that could not run leaves it to the ticker
    let mut fired_retry: Option<Instant> = None;

    let mut ticker = tokio::time::interval(core.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    tracing::info!(interval = ?core.config.interval, "Sync scheduler started");

    loop {
        let retry_at = core.next_retry(fired_retry);
        let trigger = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => "interval",
            _ = notify.notified() => "enqueue",
            _ = sleep_until(retry_at) => {
                fired_retry = retry_at;
                "retry"
            }
            changed = status.changed(), if watching => {
                if changed.is_err() {
                    // connection manager is gone; keep the other triggers
                    watching = false;
                    continue;
                }
                let connected = status.borrow_and_update().status == ConnectionStatus::Connected;
                let restored = connected && !was_connected;
                was_connected = connected;
                if !restored {
                    continue;
                }
                "reconnect"
            }
        };

        if !core.connection.is_online() {
            tracing::trace!(trigger, "Offline, drain skipped");
            continue;
        }

        tracing::debug!(trigger, "Drain triggered");
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = core.process_pending_changes() => {
                if let Err(e) = result {
                    tracing::error!(trigger, error = %e, "Drain failed");
                }
            }
        }
    }

    tracing::info!("Sync scheduler stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_sweeper(core: Arc<EngineCore>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(core.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = core.sweep().await {
                    tracing::warn!(error = %e, "Maintenance sweep failed");
                }
            }
        }
    }
}
