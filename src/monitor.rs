//! Connectivity state plus an ordered observer registry for transitions.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::fetch::Fetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Returned by [`NetworkMonitor::subscribe`]; pass back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Handler = Arc<dyn Fn(ConnectivityEvent) + Send + Sync>;

pub struct NetworkMonitor {
    state: watch::Sender<bool>,
    handlers: Mutex<Vec<(SubscriptionToken, Handler)>>,
    next_token: AtomicU64,
    // Serializes transitions so handlers observe them in order.
    delivery: Mutex<()>,
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("online", &self.is_online())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl NetworkMonitor {
    /// Seed with the platform's status at startup.
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state,
            handlers: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            delivery: Mutex::new(()),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Receiver mirroring the current state, for async consumers.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Register a handler; it receives every later transition exactly once.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(ConnectivityEvent) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((token, Arc::new(handler)));
        token
    }

    /// Returns false if the token was not registered.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(t, _)| *t != token);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Feed the platform's current status. Emits an event only on an actual
    /// transition; redundant reports are ignored.
    ///
    /// Handlers run synchronously on the reporting thread and must not call
    /// `report` themselves.
    pub fn report(&self, online: bool) -> Option<ConnectivityEvent> {
        let _delivery = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if !changed {
            return None;
        }

        let event = if online {
            ConnectivityEvent::Online
        } else {
            ConnectivityEvent::Offline
        };
        info!(?event, "connectivity changed");

        let handlers: Vec<(SubscriptionToken, Handler)> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (token, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(?token, ?event, "connectivity handler panicked");
            }
        }
        Some(event)
    }
}

/// Periodically GET `url` and report reachability. Any HTTP response counts as
/// online; only transport failures count as offline.
pub fn spawn_probe(
    monitor: Arc<NetworkMonitor>,
    fetcher: Arc<dyn Fetcher>,
    url: String,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let online = match fetcher.get(&url).await {
                Ok(_) => true,
                Err(err) => {
                    debug!(?err, "connectivity probe failed");
                    false
                }
            };
            monitor.report(online);
        }
    })
}
