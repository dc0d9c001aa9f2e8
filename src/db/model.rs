//! Aggregates computed by queries rather than loaded as rows.

use serde::Serialize;

/// Queue depth split by status, used by the sync coordinator and inspection tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub failed: i64,
}

impl QueueCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.failed
    }
}
