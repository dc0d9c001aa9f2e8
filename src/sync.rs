use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::db::{self, Pool};
use crate::error::{Error, Result};
use crate::monitor::{ConnectivityEvent, NetworkMonitor, SubscriptionToken};
use crate::replay::ActionReplayer;

/// Outcome of one pass over the pending-action queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub succeeded: Vec<i64>,
    pub failed: Vec<i64>,
    /// Left queued because they reached the caller's attempt cap.
    pub skipped: Vec<i64>,
    /// The pass stopped early because connectivity dropped.
    pub interrupted: bool,
}

impl SyncReport {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Drains the pending-action queue in FIFO order once connectivity returns.
pub struct SyncCoordinator {
    pool: Pool,
    replayer: Arc<dyn ActionReplayer>,
    monitor: Arc<NetworkMonitor>,
    max_attempts: Option<i32>,
    drain_lock: Mutex<()>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    pub fn new(pool: Pool, replayer: Arc<dyn ActionReplayer>, monitor: Arc<NetworkMonitor>) -> Self {
        Self {
            pool,
            replayer,
            monitor,
            max_attempts: None,
            drain_lock: Mutex::new(()),
        }
    }

    /// Leave actions that already failed `max_attempts` times queued without replaying them.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Replay every queued action once, strictly one at a time.
    ///
    /// A success is removed from the queue before the next action starts, so an
    /// interrupted pass never replays it again. A failure is marked `failed` and
    /// the pass continues. Concurrent callers wait for the running pass.
    #[instrument(skip_all)]
    pub async fn drain(&self) -> Result<SyncReport> {
        let _guard = self.drain_lock.lock().await;
        let queue = db::list_pending_actions(&self.pool).await?;
        let mut report = SyncReport::default();
        if queue.is_empty() {
            return Ok(report);
        }
        info!(queued = queue.len(), "draining pending actions");

        for action in queue {
            if !self.monitor.is_online() {
                warn!(next = action.id, "connectivity lost; stopping drain");
                report.interrupted = true;
                break;
            }
            if matches!(self.max_attempts, Some(max) if action.attempt >= max) {
                report.skipped.push(action.id);
                continue;
            }

            match self.replayer.replay(&action).await {
                Ok(()) => {
                    db::delete_pending_action(&self.pool, action.id).await?;
                    info!(id = action.id, kind = action.kind.as_str(), "pending action replayed");
                    report.succeeded.push(action.id);
                }
                Err(err) => {
                    let failure = Error::SyncReplay {
                        id: action.id,
                        reason: format!("{err:#}"),
                    };
                    warn!(%failure, attempt = action.attempt + 1, "keeping action queued");
                    db::mark_action_failed(&self.pool, action.id, &format!("{err:#}")).await?;
                    report.failed.push(action.id);
                }
            }
        }

        if !report.interrupted {
            db::record_sync(&self.pool, Utc::now()).await?;
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            interrupted = report.interrupted,
            "drain finished"
        );
        Ok(report)
    }

    /// Drain on every `Online` transition until the returned handle is shut down.
    pub fn spawn(self: Arc<Self>) -> SyncHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = self.monitor.subscribe(move |event| {
            let _ = tx.send(event);
        });
        let coordinator = Arc::clone(&self);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event != ConnectivityEvent::Online {
                    continue;
                }
                if let Err(err) = coordinator.drain().await {
                    error!(?err, "drain aborted");
                }
            }
        });
        SyncHandle {
            monitor: Arc::clone(&self.monitor),
            token,
            task,
        }
    }
}

/// Background drain task bound to a monitor subscription.
#[derive(Debug)]
pub struct SyncHandle {
    monitor: Arc<NetworkMonitor>,
    token: SubscriptionToken,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Unsubscribe and wait for any in-flight drain to finish.
    pub async fn shutdown(self) {
        self.monitor.unsubscribe(self.token);
        if let Err(err) = self.task.await {
            warn!(?err, "sync task did not shut down cleanly");
        }
    }
}
