//! The fetch contract between the sync loop and the source client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::event::ChangeEvent;

/// One page of changes returned by the source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResult {
    /// Events in strict source order.
    pub events: Vec<ChangeEvent>,
    /// Opaque cursor addressing the position after the last event. Empty
    /// means the source did not hand out a new position.
    pub next_token: String,
    /// True iff `next_token` is non-empty.
    pub has_more: bool,
    /// Number of events in this page.
    pub count: usize,
}

impl FetchResult {
    /// Build a page, deriving `has_more` and `count`.
    #[must_use]
    pub fn new(events: Vec<ChangeEvent>, next_token: String) -> Self {
        let has_more = !next_token.is_empty();
        let count = events.len();
        Self {
            events,
            next_token,
            has_more,
            count,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Point-in-time snapshot of source client statistics.
///
/// Counters cover whole `fetch` invocations, not individual retry attempts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetcherStats {
    pub total_requests: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
    pub total_events: u64,
    pub last_fetch_at: Option<DateTime<Utc>>,
    /// Exponentially weighted moving average of fetch latency.
    pub ewma_latency_ms: f64,
}

/// A paged change stream.
///
/// Implementations own retry, rate limiting, parsing, and validation; the
/// sync loop sees only ordered pages and opaque tokens. The empty token means
/// "from the beginning of the stream".
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Fetch up to `page_size` events starting immediately after `token`.
    ///
    /// `page_size` is a hint; the source may return fewer events.
    async fn fetch(&self, token: &str, page_size: i32) -> SyncResult<FetchResult>;

    /// Snapshot of client statistics; safe to call concurrently.
    fn stats(&self) -> FetcherStats;

    /// Short name for logging.
    fn name(&self) -> &str;
}
