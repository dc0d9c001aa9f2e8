//! The interface the application shell talks to.
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::cache::{CacheCounters, CacheEngine, Request, Served};
use crate::config::Config;
use crate::db::{self, Pool};
use crate::error::{Error, Result};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::model::{Article, Bookmark, CachedArticle, PendingAction, StorageStats};
use crate::monitor::{self, ConnectivityEvent, NetworkMonitor, SubscriptionToken};
use crate::replay::{ActionReplayer, HttpReplayer};
use crate::sync::{SyncCoordinator, SyncHandle, SyncReport};

pub struct OfflineReader {
    pool: Pool,
    engine: CacheEngine,
    monitor: Arc<NetworkMonitor>,
    coordinator: Arc<SyncCoordinator>,
}

impl std::fmt::Debug for OfflineReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineReader")
            .field("engine", &self.engine)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl OfflineReader {
    /// Open the store, wire the HTTP collaborators and bring the configured
    /// cache generation up. A manifest that cannot be fetched leaves the
    /// previous generation serving, or an empty one when there is none.
    pub async fn open(cfg: &Config, online: bool) -> Result<Self> {
        let pool = db::open(&cfg.database_url()).await?;
        let fetcher: Arc<dyn Fetcher> = Arc::new(
            HttpFetcher::from_config(cfg)
                .map_err(|err| Error::HttpClient(err.to_string()))?,
        );
        let replayer: Arc<dyn ActionReplayer> = Arc::new(
            HttpReplayer::from_config(cfg)
                .map_err(|err| Error::HttpClient(format!("{err:#}")))?,
        );
        let engine = CacheEngine::from_config(pool.clone(), fetcher, cfg)?;
        let monitor = Arc::new(NetworkMonitor::new(online));

        let name = cfg.generation_name();
        if let Err(err) = engine.bootstrap(&name).await {
            warn!(?err, generation = %name, "cache generation not installed");
            if engine.current_generation().await.is_none() {
                engine.init(&name).await?;
            }
        }
        Ok(Self::from_parts(pool, engine, monitor, replayer))
    }

    pub fn from_parts(
        pool: Pool,
        engine: CacheEngine,
        monitor: Arc<NetworkMonitor>,
        replayer: Arc<dyn ActionReplayer>,
    ) -> Self {
        let coordinator = Arc::new(SyncCoordinator::new(
            pool.clone(),
            replayer,
            Arc::clone(&monitor),
        ));
        Self {
            pool,
            engine,
            monitor,
            coordinator,
        }
    }

    /// Start draining the queue on every return to online.
    pub fn start_sync(&self) -> SyncHandle {
        Arc::clone(&self.coordinator).spawn()
    }

    /// Start probing `url` as the platform connectivity source.
    pub fn start_probe(&self, fetcher: Arc<dyn Fetcher>, url: String, interval: Duration) -> JoinHandle<()> {
        monitor::spawn_probe(Arc::clone(&self.monitor), fetcher, url, interval)
    }

    pub async fn classify_and_serve(&self, request: &Request) -> Served {
        self.engine.classify_and_serve(request).await
    }

    pub async fn get_bookmarks(&self) -> Result<Vec<Bookmark>> {
        db::get_bookmarks(&self.pool).await
    }

    /// Store the bookmark locally and queue it for the server. Both writes
    /// commit together or not at all.
    #[instrument(skip_all, fields(url = %article.url))]
    pub async fn add_bookmark(&self, article: &Article) -> Result<Bookmark> {
        let payload = json!({ "url": article.url, "article": article });
        let (bookmark, action) = db::put_bookmark_with_intent(&self.pool, article, &payload).await?;
        self.after_enqueue(&action).await;
        Ok(bookmark)
    }

    /// Removing a URL that was never bookmarked changes nothing and queues nothing.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn remove_bookmark(&self, url: &str) -> Result<()> {
        let payload = json!({ "url": url });
        if let Some(action) = db::remove_bookmark_with_intent(&self.pool, url, &payload).await? {
            self.after_enqueue(&action).await;
        }
        Ok(())
    }

    pub async fn is_bookmarked(&self, url: &str) -> Result<bool> {
        db::is_bookmarked(&self.pool, url).await
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats> {
        db::compute_storage_stats(&self.pool).await
    }

    pub async fn clear_article_cache(&self) -> Result<u64> {
        db::clear_article_cache(&self.pool).await
    }

    pub fn subscribe_connectivity<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(ConnectivityEvent) + Send + Sync + 'static,
    {
        self.monitor.subscribe(handler)
    }

    pub fn unsubscribe_connectivity(&self, token: SubscriptionToken) -> bool {
        self.monitor.unsubscribe(token)
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    pub fn monitor(&self) -> Arc<NetworkMonitor> {
        Arc::clone(&self.monitor)
    }

    pub async fn cache_article(&self, article: &Article) -> Result<CachedArticle> {
        db::cache_article(&self.pool, article).await
    }

    pub async fn get_cached_article(&self, url: &str) -> Result<Option<CachedArticle>> {
        db::get_cached_article(&self.pool, url).await
    }

    /// Newest cached articles, for a first screen while offline.
    pub async fn recent_articles(&self, limit: u32) -> Result<Vec<CachedArticle>> {
        db::recent_cached_articles(&self.pool, limit).await
    }

    pub async fn pending_actions(&self) -> Result<Vec<PendingAction>> {
        db::list_pending_actions(&self.pool).await
    }

    /// Manual "sync now": one drain pass regardless of transitions.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.coordinator.drain().await
    }

    pub async fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>> {
        db::last_synced_at(&self.pool).await
    }

    pub fn cache_counters(&self) -> CacheCounters {
        self.engine.counters()
    }

    /// Empty the current cache generation. Bookmarks and cached articles stay.
    pub async fn clear_cache(&self) -> Result<u64> {
        self.engine.clear_current().await
    }

    pub fn engine(&self) -> &CacheEngine {
        &self.engine
    }

    // Every intent goes through the queue so replay order matches the order the
    // user acted in. When online the whole queue is drained right away, which
    // also retries entries that failed earlier: replaying only the new action
    // could overtake an older failed one for the same URL. A drain error is
    // logged and leaves the action queued for the next Online transition.
    async fn after_enqueue(&self, action: &PendingAction) {
        if !self.monitor.is_online() {
            info!(id = action.id, kind = action.kind.as_str(), "offline; action queued");
            return;
        }
        if let Err(err) = self.coordinator.drain().await {
            warn!(?err, id = action.id, "immediate sync failed; action stays queued");
        }
    }
}
