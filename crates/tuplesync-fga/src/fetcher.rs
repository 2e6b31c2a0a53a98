//! Retrying, rate-limited change fetcher.
//!
//! Wraps the raw API client with everything the sync loop expects from a
//! [`ChangeSource`]: bounded exponential backoff on transient faults, a
//! minimum inter-request pacer, defensive record parsing, advisory
//! validation, and per-invocation statistics. All waits are cancellable by
//! the shutdown signal.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use tuplesync_core::{ChangeEvent, ChangeSource, FetchResult, FetcherStats, SyncError, SyncResult};

use crate::client::FgaApi;
use crate::parse::parse_change;
use crate::retry::RetryConfig;

/// Tuning knobs for the fetcher.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Page size hint used when the caller passes a non-positive size.
    pub page_size: i32,
    pub retry: RetryConfig,
    /// Minimum period between fetch attempts; zero disables pacing.
    pub rate_limit_delay: Duration,
    /// Emit advisory validation warnings for incomplete events.
    pub enable_validation: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            retry: RetryConfig::default(),
            rate_limit_delay: Duration::from_millis(50),
            enable_validation: true,
        }
    }
}

/// Enforces a minimum period between requests.
struct Pacer {
    min_interval: Duration,
    next_at: Mutex<Instant>,
}

impl Pacer {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_at: Mutex::new(Instant::now()),
        }
    }

    async fn wait(&self, shutdown: &CancellationToken) -> SyncResult<()> {
        let mut next_at = self.next_at.lock().await;
        let now = Instant::now();
        if *next_at > now {
            tokio::select! {
                () = shutdown.cancelled() => return Err(SyncError::Cancelled),
                () = tokio::time::sleep_until(*next_at) => {}
            }
        }
        *next_at = Instant::now() + self.min_interval;
        Ok(())
    }
}

/// Smoothing factor for the latency moving average.
const EWMA_ALPHA: f64 = 0.2;

/// Lock-free statistics cell; gauges are read concurrently by the
/// observability surface while the fetch path updates them.
#[derive(Default)]
struct StatsCell {
    total_requests: AtomicU64,
    success_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_events: AtomicU64,
    /// Epoch milliseconds of the last fetch; 0 = never.
    last_fetch_ms: AtomicI64,
    /// EWMA latency in milliseconds, stored as f64 bits.
    ewma_latency_bits: AtomicU64,
}

impl StatsCell {
    fn record(&self, success: bool, events: usize, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.total_events.fetch_add(events as u64, Ordering::Relaxed);
        self.last_fetch_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        let sample = latency.as_secs_f64() * 1000.0;
        let previous = f64::from_bits(self.ewma_latency_bits.load(Ordering::Relaxed));
        let next = if self.total_requests.load(Ordering::Relaxed) <= 1 {
            sample
        } else {
            previous + EWMA_ALPHA * (sample - previous)
        };
        self.ewma_latency_bits
            .store(next.to_bits(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> FetcherStats {
        let last_ms = self.last_fetch_ms.load(Ordering::Relaxed);
        FetcherStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            success_requests: self.success_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            total_events: self.total_events.load(Ordering::Relaxed),
            last_fetch_at: (last_ms != 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(last_ms))
                .flatten(),
            ewma_latency_ms: f64::from_bits(self.ewma_latency_bits.load(Ordering::Relaxed)),
        }
    }
}

/// The production [`ChangeSource`].
pub struct ChangeFetcher {
    api: FgaApi,
    options: FetchOptions,
    pacer: Option<Pacer>,
    stats: StatsCell,
    shutdown: CancellationToken,
}

impl ChangeFetcher {
    #[must_use]
    pub fn new(api: FgaApi, options: FetchOptions, shutdown: CancellationToken) -> Self {
        let pacer = (options.rate_limit_delay > Duration::ZERO)
            .then(|| Pacer::new(options.rate_limit_delay));
        Self {
            api,
            options,
            pacer,
            stats: StatsCell::default(),
            shutdown,
        }
    }

    #[must_use]
    pub fn api(&self) -> &FgaApi {
        &self.api
    }

    /// One paced, retried page fetch. Statistics are updated exactly once per
    /// call, regardless of how many attempts it took.
    #[instrument(
        name = "source.fetch_changes",
        skip(self),
        fields(
            store_id = %self.api.store_id(),
            token_in = token,
            page_size,
            events_count = tracing::field::Empty,
            token_out = tracing::field::Empty,
            has_more = tracing::field::Empty,
            error_kind = tracing::field::Empty,
        )
    )]
    async fn fetch_page(&self, token: &str, page_size: i32) -> SyncResult<FetchResult> {
        let started = Instant::now();

        let page = match self.read_with_retry(token, page_size).await {
            Ok(page) => page,
            Err(err) => {
                self.stats.record(false, 0, started.elapsed());
                tracing::Span::current().record("error_kind", err.code());
                return Err(err);
            }
        };

        let mut events: Vec<ChangeEvent> = Vec::with_capacity(page.changes.len());
        for record in &page.changes {
            match parse_change(record) {
                Ok(event) => events.push(event),
                Err(err) => {
                    warn!(error = %err, "skipping malformed change record");
                }
            }
        }

        if self.options.enable_validation {
            for event in &events {
                let findings = event.validation_findings();
                if !findings.is_empty() {
                    warn!(
                        fields = ?findings,
                        object = %event.object(),
                        relation = %event.relation,
                        "change event failed validation, forwarding anyway"
                    );
                }
            }
        }

        self.stats.record(true, events.len(), started.elapsed());

        let next_token = page.continuation_token.unwrap_or_default();
        let result = FetchResult::new(events, next_token);

        let span = tracing::Span::current();
        span.record("events_count", result.count);
        span.record("token_out", result.next_token.as_str());
        span.record("has_more", result.has_more);

        Ok(result)
    }

    async fn read_with_retry(
        &self,
        token: &str,
        page_size: i32,
    ) -> SyncResult<crate::client::ReadChangesPage> {
        let retry = &self.options.retry;
        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if let Some(pacer) = &self.pacer {
                pacer.wait(&self.shutdown).await?;
            }

            match self.api.read_changes(token, page_size).await {
                Ok(page) => return Ok(page),
                Err(err) => {
                    if matches!(err, SyncError::Cancelled)
                        || !err.is_transient()
                        || attempt >= retry.max_retries
                    {
                        return Err(err);
                    }
                    let delay = retry.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "fetch attempt failed, backing off"
                    );
                    tokio::select! {
                        () = self.shutdown.cancelled() => return Err(SyncError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Drain all available pages starting after `start_token`.
    ///
    /// `max_events` of 0 means unlimited. Cancellation is honored between
    /// pages. The returned result carries the final token with
    /// `has_more = false`.
    pub async fn fetch_all(&self, start_token: &str, max_events: usize) -> SyncResult<FetchResult> {
        let mut all_events = Vec::new();
        let mut current_token = start_token.to_string();

        loop {
            if self.shutdown.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if max_events > 0 && all_events.len() >= max_events {
                debug!(total = all_events.len(), "reached max events cap");
                break;
            }

            let page = self
                .fetch_page(&current_token, self.options.page_size)
                .await?;
            let done = !page.has_more;
            if !page.next_token.is_empty() {
                current_token = page.next_token;
            }
            all_events.extend(page.events);
            if done {
                break;
            }
        }

        let count = all_events.len();
        Ok(FetchResult {
            events: all_events,
            next_token: current_token,
            has_more: false,
            count,
        })
    }

    /// Backfill helper: drain the stream from the beginning and keep only
    /// events at or after `since`.
    pub async fn fetch_since(
        &self,
        since: chrono::DateTime<Utc>,
        max_events: usize,
    ) -> SyncResult<FetchResult> {
        let mut result = self.fetch_all("", max_events).await?;
        result.events.retain(|e| e.timestamp >= since);
        result.count = result.events.len();
        debug!(since = %since, kept = result.count, "filtered backfill by timestamp");
        Ok(result)
    }
}

#[async_trait]
impl ChangeSource for ChangeFetcher {
    async fn fetch(&self, token: &str, page_size: i32) -> SyncResult<FetchResult> {
        let size = if page_size > 0 {
            page_size
        } else {
            self.options.page_size
        };
        self.fetch_page(token, size).await
    }

    fn stats(&self) -> FetcherStats {
        self.stats.snapshot()
    }

    fn name(&self) -> &str {
        "fga-change-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pacer_enforces_minimum_interval() {
        let pacer = Pacer::new(Duration::from_millis(40));
        let shutdown = CancellationToken::new();

        let start = Instant::now();
        pacer.wait(&shutdown).await.unwrap();
        pacer.wait(&shutdown).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn pacer_wait_is_cancellable() {
        let pacer = Pacer::new(Duration::from_secs(60));
        let shutdown = CancellationToken::new();
        pacer.wait(&shutdown).await.unwrap();

        shutdown.cancel();
        let err = pacer.wait(&shutdown).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }

    #[test]
    fn stats_count_invocations_not_attempts() {
        let cell = StatsCell::default();
        cell.record(true, 5, Duration::from_millis(10));
        cell.record(false, 0, Duration::from_millis(30));

        let snapshot = cell.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.success_requests, 1);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.total_events, 5);
        assert!(snapshot.last_fetch_at.is_some());
    }

    #[test]
    fn latency_average_is_smoothed() {
        let cell = StatsCell::default();
        cell.record(true, 0, Duration::from_millis(100));
        let first = cell.snapshot().ewma_latency_ms;
        assert!((first - 100.0).abs() < 1.0);

        cell.record(true, 0, Duration::from_millis(200));
        let second = cell.snapshot().ewma_latency_ms;
        assert!(second > first);
        assert!(second < 200.0);
    }

    #[test]
    fn empty_stats_snapshot_has_no_fetch_time() {
        let snapshot = StatsCell::default().snapshot();
        assert!(snapshot.last_fetch_at.is_none());
        assert_eq!(snapshot.ewma_latency_ms, 0.0);
    }
}
