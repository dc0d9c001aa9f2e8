use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::PendingAction;

/// Replays one queued action against the network.
#[async_trait]
pub trait ActionReplayer: Send + Sync {
    async fn replay(&self, action: &PendingAction) -> Result<()>;
}

/// POSTs each action as JSON to the sync endpoint, keyed by its `action_id`
/// so the server can drop duplicates of a replay that was already applied.
#[derive(Clone)]
pub struct HttpReplayer {
    http: Client,
    endpoint: Url,
}

impl fmt::Debug for HttpReplayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpReplayer")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpReplayer {
    pub fn new(endpoint: Url) -> Result<Self> {
        let http = Client::builder()
            .user_agent("news-offline/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, endpoint })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let endpoint = Url::parse(&cfg.sync.endpoint).context("invalid sync.endpoint")?;
        Self::new(endpoint)
    }

    pub fn build_request(&self, action: &PendingAction) -> Result<reqwest::Request> {
        self.http
            .post(self.endpoint.clone())
            .header("Idempotency-Key", action.action_id.to_string())
            .header("Content-Type", "application/json")
            .json(&action_body(action))
            .build()
            .context("failed to build sync request")
    }
}

pub fn action_body(action: &PendingAction) -> Value {
    json!({
        "actionId": action.action_id,
        "type": action.kind.as_str(),
        "payload": action.payload,
        "enqueuedAt": action.enqueued_at,
        "attempt": action.attempt,
    })
}

#[async_trait]
impl ActionReplayer for HttpReplayer {
    async fn replay(&self, action: &PendingAction) -> Result<()> {
        let request = self.build_request(action)?;
        debug!(url = %request.url(), id = action.id, kind = action.kind.as_str(), "replaying action");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach sync endpoint")?;

        let status = res.status();
        // 409 means the server already holds this action_id.
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(());
        }
        let body = res.text().await.unwrap_or_default();
        warn!(%status, %body, id = action.id, "sync endpoint rejected action");
        Err(anyhow!("sync endpoint returned {}: {}", status, body))
    }
}
