//! Strategy engine: serves each request from the current generation, the network, or both.
use futures::future::try_join_all;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::classify::{manifest_urls, Classifier, Policy, Request};
use super::generation::{GenerationPhase, GenerationRegister, InstalledGeneration};
use super::storage::AssetStore;
use crate::config::Config;
use crate::db::Pool;
use crate::error::{Error, Result};
use crate::fetch::{Fetcher, HttpResponse, NetworkError};

/// Status of the synthetic response for a cache-first miss with no network.
pub const CACHE_FIRST_UNAVAILABLE: u16 = 408;
/// Status of the synthetic response when network and cache both fail otherwise.
pub const NETWORK_UNAVAILABLE: u16 = 503;
/// Marks responses fabricated locally; real responses never carry it.
pub const SYNTHETIC_HEADER: &str = "x-offline-synthetic";

const REVALIDATE_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
    pub policy: Policy,
    pub source: ResponseSource,
    pub response: HttpResponse,
}

impl Served {
    /// True for the locally fabricated "content unavailable" result.
    pub fn is_unavailable(&self) -> bool {
        self.source == ResponseSource::Synthetic
    }
}

/// Outcome of switching the current generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub name: String,
    pub purged: Vec<String>,
    pub superseded: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheCounters {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub network: u64,
    pub synthetic: u64,
    pub revalidate_failures: u64,
}

impl CacheCounters {
    /// Share of cache lookups that found an entry, in percent.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        (self.hits as f64 / lookups as f64) * 100.0
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    network: AtomicU64,
    synthetic: AtomicU64,
    revalidate_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheCounters {
        CacheCounters {
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            network: self.network.load(Ordering::Relaxed),
            synthetic: self.synthetic.load(Ordering::Relaxed),
            revalidate_failures: self.revalidate_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<Inner>,
}

struct Inner {
    assets: AssetStore,
    fetcher: Arc<dyn Fetcher>,
    classifier: Classifier,
    manifest: Vec<String>,
    register: GenerationRegister,
    counters: Counters,
    revalidate_attempts: u32,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("classifier", &self.inner.classifier)
            .field("manifest", &self.inner.manifest)
            .finish_non_exhaustive()
    }
}

impl CacheEngine {
    pub fn new(
        assets: AssetStore,
        fetcher: Arc<dyn Fetcher>,
        classifier: Classifier,
        manifest: Vec<String>,
        revalidate_attempts: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                assets,
                fetcher,
                classifier,
                manifest,
                register: GenerationRegister::new(),
                counters: Counters::default(),
                revalidate_attempts: revalidate_attempts.max(1),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn from_config(pool: Pool, fetcher: Arc<dyn Fetcher>, cfg: &Config) -> Result<Self> {
        let manifest = manifest_urls(cfg)?
            .into_iter()
            .map(|u| u.to_string())
            .collect();
        Ok(Self::new(
            AssetStore::new(pool),
            fetcher,
            Classifier::from_config(cfg)?,
            manifest,
            cfg.cache.revalidate_attempts,
        ))
    }

    #[instrument(skip_all, fields(url = %req.url))]
    pub async fn classify_and_serve(&self, req: &Request) -> Served {
        let policy = self.inner.classifier.classify(req);
        Counters::bump(&self.inner.counters.requests);
        let key = req.key();
        let (source, response) = match policy {
            Policy::CacheFirst => self.cache_first(key).await,
            Policy::NetworkFirst => self.network_first(key).await,
            Policy::StaleWhileRevalidate => self.stale_while_revalidate(key).await,
        };
        debug!(
            policy = policy.as_str(),
            ?source,
            status = response.status,
            "served"
        );
        Served {
            policy,
            source,
            response,
        }
    }

    async fn cache_first(&self, key: &str) -> (ResponseSource, HttpResponse) {
        let generation = self.inner.register.current().await;
        if let Some(hit) = self.inner.lookup(generation.as_deref(), key).await {
            return (ResponseSource::Cache, hit);
        }
        match self.inner.fetcher.get(key).await {
            Ok(response) => self.inner.accept(generation.as_deref(), key, response).await,
            Err(err) => {
                warn!(?err, "cache-first miss while offline");
                self.inner.synthetic(CACHE_FIRST_UNAVAILABLE)
            }
        }
    }

    async fn network_first(&self, key: &str) -> (ResponseSource, HttpResponse) {
        let generation = self.inner.register.current().await;
        match self.inner.fetcher.get(key).await {
            Ok(response) => self.inner.accept(generation.as_deref(), key, response).await,
            Err(err) => {
                debug!(?err, "network-first fetch failed; falling back to cache");
                match self.inner.lookup(generation.as_deref(), key).await {
                    Some(hit) => (ResponseSource::Cache, hit),
                    None => self.inner.synthetic(NETWORK_UNAVAILABLE),
                }
            }
        }
    }

    async fn stale_while_revalidate(&self, key: &str) -> (ResponseSource, HttpResponse) {
        let generation = self.inner.register.current().await;
        if let Some(hit) = self.inner.lookup(generation.as_deref(), key).await {
            // The hit is already in hand, so the refresh can only affect later requests.
            if let Some(generation) = generation {
                self.spawn_revalidate(generation, key.to_string());
            }
            return (ResponseSource::Cache, hit);
        }
        match self.inner.fetcher.get(key).await {
            Ok(response) => self.inner.accept(generation.as_deref(), key, response).await,
            Err(err) => {
                debug!(?err, "no cached copy and network failed");
                self.inner.synthetic(NETWORK_UNAVAILABLE)
            }
        }
    }

    fn spawn_revalidate(&self, generation: String, key: String) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            inner.revalidate(&generation, &key).await;
        });
        let mut tasks = self
            .inner
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Wait for every background revalidation started so far.
    pub async fn settle(&self) {
        let tasks = std::mem::take(
            &mut *self
                .inner
                .background
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for task in tasks {
            if let Err(err) = task.await {
                warn!(?err, "revalidation task did not complete");
            }
        }
    }

    /// Fetch the static manifest into a new `installing` generation.
    ///
    /// Any failed or non-2xx manifest fetch discards everything written for
    /// `name`; nothing becomes active.
    #[instrument(skip_all, fields(generation = %name))]
    pub async fn install(&self, name: &str) -> Result<InstalledGeneration> {
        if self.inner.register.current().await.as_deref() == Some(name) {
            let assets = self.inner.assets.count_assets(name).await?;
            info!(assets, "generation already current");
            return Ok(InstalledGeneration {
                name: name.to_string(),
                assets: usize::try_from(assets).unwrap_or_default(),
            });
        }

        if self.inner.register.is_superseded(name) {
            return Err(Error::GenerationLifecycle {
                generation: name.to_string(),
                phase: GenerationPhase::Superseded.as_str(),
            });
        }

        self.inner.assets.begin_generation(name).await?;
        let fetcher = &self.inner.fetcher;
        let fetched = try_join_all(self.inner.manifest.iter().map(|url| async move {
            let response = fetcher.get(url).await?;
            if !response.is_success() {
                return Err(NetworkError::Transport {
                    url: url.clone(),
                    reason: format!("unexpected status {}", response.status),
                });
            }
            Ok::<_, NetworkError>((url.as_str(), response))
        }))
        .await;

        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(source) => {
                warn!(?source, "manifest fetch failed; discarding partial generation");
                self.discard(name).await;
                return Err(Error::Install {
                    generation: name.to_string(),
                    source,
                });
            }
        };

        for (url, response) in &fetched {
            if let Err(err) = self.inner.assets.put(name, url, response).await {
                self.discard(name).await;
                return Err(err);
            }
        }
        info!(assets = fetched.len(), "generation installed");
        Ok(InstalledGeneration {
            name: name.to_string(),
            assets: fetched.len(),
        })
    }

    async fn discard(&self, name: &str) {
        if let Err(err) = self.inner.assets.delete_generation(name).await {
            warn!(?err, generation = name, "failed to discard partial generation");
        }
    }

    /// Make `installed` current, purging every other stored generation first.
    ///
    /// The register's write lock is held for the whole purge-and-swap, so
    /// in-flight cache writes either land before the purge or are dropped.
    /// A superseded generation never comes back.
    #[instrument(skip_all, fields(generation = %installed.name))]
    pub async fn activate(&self, installed: InstalledGeneration) -> Result<Activation> {
        let mut guard = self.inner.register.write().await;
        if self.inner.register.is_superseded(&installed.name) {
            return Err(Error::GenerationLifecycle {
                generation: installed.name,
                phase: GenerationPhase::Superseded.as_str(),
            });
        }
        let purged = self.inner.assets.activate(&installed.name).await?;
        let superseded = self.inner.register.swap(&mut guard, &installed.name);
        drop(guard);
        info!(purged = purged.len(), ?superseded, "generation activated");
        Ok(Activation {
            name: installed.name,
            purged,
            superseded,
        })
    }

    /// Adopt the stored active generation if it matches `name`, otherwise
    /// install and activate `name`. A failed install keeps the old generation serving.
    pub async fn bootstrap(&self, name: &str) -> Result<()> {
        match self.inner.assets.active_generation().await? {
            Some(active) if active == name => {
                self.inner.register.init(&active).await;
                info!(generation = name, "adopted stored generation");
                Ok(())
            }
            Some(active) => {
                self.inner.register.init(&active).await;
                let installed = self.install(name).await?;
                self.activate(installed).await.map(|_| ())
            }
            None => {
                let installed = self.install(name).await?;
                self.activate(installed).await.map(|_| ())
            }
        }
    }

    /// Point the register at `name` without preloading; used when nothing is
    /// active and the manifest cannot be fetched.
    pub async fn init(&self, name: &str) -> Result<()> {
        self.inner.assets.begin_generation(name).await?;
        self.inner.register.init(name).await;
        Ok(())
    }

    pub async fn teardown(&self) {
        self.settle().await;
        self.inner.register.teardown().await;
    }

    /// Drop every asset of the current generation.
    pub async fn clear_current(&self) -> Result<u64> {
        let guard = self.inner.register.read().await;
        let Some(generation) = guard.as_deref() else {
            return Ok(0);
        };
        let removed = self.inner.assets.clear_generation(generation).await?;
        info!(generation, removed, "cleared current generation");
        Ok(removed)
    }

    pub async fn current_generation(&self) -> Option<String> {
        self.inner.register.current().await
    }

    pub fn superseded_generations(&self) -> Vec<String> {
        self.inner.register.superseded()
    }

    pub fn counters(&self) -> CacheCounters {
        self.inner.counters.snapshot()
    }

    pub fn classify(&self, req: &Request) -> Policy {
        self.inner.classifier.classify(req)
    }
}

impl Inner {
    async fn lookup(&self, generation: Option<&str>, key: &str) -> Option<HttpResponse> {
        let found = match generation {
            Some(generation) => match self.assets.get(generation, key).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(?err, url = key, "cache read failed; treating as miss");
                    None
                }
            },
            None => None,
        };
        match found {
            Some(hit) => {
                Counters::bump(&self.counters.hits);
                Some(hit)
            }
            None => {
                Counters::bump(&self.counters.misses);
                None
            }
        }
    }

    /// Hand a network response to the caller, caching it when it is a 2xx.
    async fn accept(
        &self,
        generation: Option<&str>,
        key: &str,
        response: HttpResponse,
    ) -> (ResponseSource, HttpResponse) {
        Counters::bump(&self.counters.network);
        if response.is_success() {
            if let Some(generation) = generation {
                self.store_if_current(generation, key, &response).await;
            }
        }
        (ResponseSource::Network, response)
    }

    async fn store_if_current(&self, generation: &str, key: &str, response: &HttpResponse) {
        let guard = self.register.read().await;
        if guard.as_deref() != Some(generation) {
            debug!(generation, url = key, "generation no longer current; dropping write");
            return;
        }
        if let Err(err) = self.assets.put(generation, key, response).await {
            warn!(?err, url = key, "failed to write cache entry");
        }
    }

    async fn revalidate(&self, generation: &str, key: &str) {
        for attempt in 1..=self.revalidate_attempts {
            match self.fetcher.get(key).await {
                Ok(response) if response.is_success() => {
                    self.store_if_current(generation, key, &response).await;
                    debug!(url = key, attempt, "revalidated");
                    return;
                }
                Ok(response) => {
                    debug!(url = key, status = response.status, "revalidation not cacheable; keeping cached copy");
                    return;
                }
                Err(err) => warn!(?err, url = key, attempt, "background revalidation failed"),
            }
            if attempt < self.revalidate_attempts {
                tokio::time::sleep(REVALIDATE_BACKOFF * attempt).await;
            }
        }
        Counters::bump(&self.counters.revalidate_failures);
    }

    fn synthetic(&self, status: u16) -> (ResponseSource, HttpResponse) {
        Counters::bump(&self.counters.synthetic);
        let response = HttpResponse::new(status, "content unavailable offline")
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_header(SYNTHETIC_HEADER, "1");
        (ResponseSource::Synthetic, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_ignores_network_only_requests() {
        let counters = CacheCounters {
            requests: 10,
            hits: 3,
            misses: 1,
            network: 7,
            ..Default::default()
        };
        assert_eq!(counters.hit_ratio(), 75.0);
        assert_eq!(CacheCounters::default().hit_ratio(), 0.0);
    }
}
