use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use news_offline::db;
use news_offline::model::{ActionKind, ActionStatus, PendingAction};
use news_offline::monitor::NetworkMonitor;
use news_offline::replay::ActionReplayer;
use news_offline::sync::SyncCoordinator;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Clone, Default)]
struct RecordingReplayer {
    responses: Arc<Mutex<VecDeque<Result<()>>>>,
    calls: Arc<Mutex<Vec<(i64, String)>>>,
    // Reports offline once this many replays have run.
    cut_after: Option<(usize, Arc<NetworkMonitor>)>,
}

impl RecordingReplayer {
    fn with_responses(responses: Vec<Result<()>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    fn cutting_network_after(mut self, n: usize, monitor: Arc<NetworkMonitor>) -> Self {
        self.cut_after = Some((n, monitor));
        self
    }

    async fn calls(&self) -> Vec<(i64, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl ActionReplayer for RecordingReplayer {
    async fn replay(&self, action: &PendingAction) -> Result<()> {
        let url = action.payload["url"].as_str().unwrap_or_default().to_string();
        // Give a competing drain the chance to run while this replay is in flight.
        tokio::task::yield_now().await;
        let made = {
            let mut calls = self.calls.lock().await;
            calls.push((action.id, url));
            calls.len()
        };
        if let Some((n, monitor)) = &self.cut_after {
            if made >= *n {
                monitor.report(false);
            }
        }
        self.responses.lock().await.pop_front().unwrap_or(Ok(()))
    }
}

async fn enqueue(pool: &sqlx::SqlitePool, kind: ActionKind, url: &str) -> PendingAction {
    db::enqueue_pending_action(pool, kind, &json!({ "url": url }))
        .await
        .unwrap()
}

#[tokio::test]
async fn drain_replays_in_fifo_order_and_empties_queue() {
    let pool = setup_pool().await;
    let a = enqueue(&pool, ActionKind::AddBookmark, "https://a").await;
    let b = enqueue(&pool, ActionKind::RemoveBookmark, "https://b").await;

    let replayer = RecordingReplayer::default();
    let coordinator = SyncCoordinator::new(
        pool.clone(),
        Arc::new(replayer.clone()),
        Arc::new(NetworkMonitor::new(true)),
    );
    let report = coordinator.drain().await.unwrap();

    assert_eq!(report.succeeded, vec![a.id, b.id]);
    assert!(report.failed.is_empty());
    assert_eq!(
        replayer.calls().await,
        vec![(a.id, "https://a".to_string()), (b.id, "https://b".to_string())]
    );
    assert!(db::list_pending_actions(&pool).await.unwrap().is_empty());
    assert!(db::last_synced_at(&pool).await.unwrap().is_some());
}

#[tokio::test]
async fn failed_action_stays_queued_and_later_ones_still_run() {
    let pool = setup_pool().await;
    let a = enqueue(&pool, ActionKind::AddBookmark, "https://a").await;
    let b = enqueue(&pool, ActionKind::AddBookmark, "https://b").await;

    let replayer = RecordingReplayer::with_responses(vec![Err(anyhow!("server said no")), Ok(())]);
    let coordinator = SyncCoordinator::new(
        pool.clone(),
        Arc::new(replayer.clone()),
        Arc::new(NetworkMonitor::new(true)),
    );
    let report = coordinator.drain().await.unwrap();

    assert_eq!(report.failed, vec![a.id]);
    assert_eq!(report.succeeded, vec![b.id]);

    let remaining = db::list_pending_actions(&pool).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, a.id);
    assert_eq!(remaining[0].status, ActionStatus::Failed);
    assert_eq!(remaining[0].attempt, 1);
    assert!(remaining[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("server said no"));

    // The failed action is retried on the next pass.
    let retry = coordinator.drain().await.unwrap();
    assert_eq!(retry.succeeded, vec![a.id]);
    assert!(db::list_pending_actions(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn drain_stops_when_connectivity_drops() {
    let pool = setup_pool().await;
    let a = enqueue(&pool, ActionKind::AddBookmark, "https://a").await;
    let b = enqueue(&pool, ActionKind::AddBookmark, "https://b").await;
    let c = enqueue(&pool, ActionKind::AddBookmark, "https://c").await;

    let monitor = Arc::new(NetworkMonitor::new(true));
    let replayer = RecordingReplayer::default().cutting_network_after(1, Arc::clone(&monitor));
    let coordinator =
        SyncCoordinator::new(pool.clone(), Arc::new(replayer.clone()), Arc::clone(&monitor));
    let report = coordinator.drain().await.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.succeeded, vec![a.id]);
    let remaining: Vec<i64> = db::list_pending_actions(&pool)
        .await
        .unwrap()
        .iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(remaining, vec![b.id, c.id]);
    assert!(db::last_synced_at(&pool).await.unwrap().is_none());

    // Back online: the rest goes out, and nothing is replayed twice.
    monitor.report(true);
    let resumed = SyncCoordinator::new(
        pool.clone(),
        Arc::new(replayer.clone()),
        Arc::new(NetworkMonitor::new(true)),
    );
    let report = resumed.drain().await.unwrap();
    assert_eq!(report.succeeded, vec![b.id, c.id]);
    let replayed: Vec<i64> = replayer.calls().await.iter().map(|(id, _)| *id).collect();
    assert_eq!(replayed, vec![a.id, b.id, c.id]);
}

#[tokio::test]
async fn offline_drain_replays_nothing() {
    let pool = setup_pool().await;
    enqueue(&pool, ActionKind::AddBookmark, "https://a").await;

    let replayer = RecordingReplayer::default();
    let coordinator = SyncCoordinator::new(
        pool.clone(),
        Arc::new(replayer.clone()),
        Arc::new(NetworkMonitor::new(false)),
    );
    let report = coordinator.drain().await.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.attempted(), 0);
    assert!(replayer.calls().await.is_empty());
    assert_eq!(db::count_pending_actions(&pool).await.unwrap().pending, 1);
}

#[tokio::test]
async fn attempt_cap_skips_exhausted_actions() {
    let pool = setup_pool().await;
    let a = enqueue(&pool, ActionKind::AddBookmark, "https://a").await;
    let b = enqueue(&pool, ActionKind::AddBookmark, "https://b").await;
    db::mark_action_failed(&pool, a.id, "boom").await.unwrap();
    db::mark_action_failed(&pool, a.id, "boom").await.unwrap();

    let replayer = RecordingReplayer::default();
    let coordinator = SyncCoordinator::new(
        pool.clone(),
        Arc::new(replayer.clone()),
        Arc::new(NetworkMonitor::new(true)),
    )
    .with_max_attempts(2);
    let report = coordinator.drain().await.unwrap();

    assert_eq!(report.skipped, vec![a.id]);
    assert_eq!(report.succeeded, vec![b.id]);
    assert_eq!(db::count_pending_actions(&pool).await.unwrap().failed, 1);
}

#[tokio::test]
async fn spawned_coordinator_drains_on_online_transition() {
    let pool = setup_pool().await;
    enqueue(&pool, ActionKind::AddBookmark, "https://a").await;
    enqueue(&pool, ActionKind::RemoveBookmark, "https://a").await;

    let monitor = Arc::new(NetworkMonitor::new(false));
    let replayer = RecordingReplayer::default();
    let coordinator = Arc::new(SyncCoordinator::new(
        pool.clone(),
        Arc::new(replayer.clone()),
        Arc::clone(&monitor),
    ));
    let handle = coordinator.spawn();
    assert_eq!(monitor.subscriber_count(), 1);

    monitor.report(true);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !db::list_pending_actions(&pool).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue drained after going online");

    assert_eq!(replayer.calls().await.len(), 2);
    handle.shutdown().await;
    assert_eq!(monitor.subscriber_count(), 0);
}

#[tokio::test]
async fn concurrent_drains_replay_each_action_once() {
    let pool = setup_pool().await;
    let a = enqueue(&pool, ActionKind::AddBookmark, "https://a").await;
    let b = enqueue(&pool, ActionKind::AddBookmark, "https://b").await;

    let replayer = RecordingReplayer::default();
    let coordinator = SyncCoordinator::new(
        pool.clone(),
        Arc::new(replayer.clone()),
        Arc::new(NetworkMonitor::new(true)),
    );
    let (first, second) = tokio::join!(coordinator.drain(), coordinator.drain());
    let (first, second) = (first.unwrap(), second.unwrap());

    let replayed: Vec<i64> = replayer.calls().await.iter().map(|(id, _)| *id).collect();
    assert_eq!(replayed, vec![a.id, b.id]);
    assert_eq!(first.attempted() + second.attempted(), 2);
    assert!(db::list_pending_actions(&pool).await.unwrap().is_empty());
}
