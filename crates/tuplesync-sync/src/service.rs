//! The periodic sync loop.
//!
//! One pipeline invocation ("tick") per timer period: fetch a page after the
//! current token, dispatch it to the sink by mode, and advance the cursor.
//! The sink commits events and token as one unit. Ticks never overlap; a
//! slow tick delays the next one. Tick failures are logged and counted, and
//! the loop continues from the same in-memory token.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tuplesync_core::{ChangeSource, SyncError, SyncResult};
use tuplesync_store::{ChangeSink, SinkMode};

use crate::metrics::{StatusLabels, StorageOpLabels, SyncMetrics};

/// Loop tuning.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Tick period.
    pub poll_interval: Duration,
    /// Page-size hint passed to the source.
    pub page_size: i32,
    /// Hard cap on events per tick; 0 means unlimited. Clamps the page size.
    pub max_events_per_tick: usize,
    /// Deadline for sink teardown during drain.
    pub drain_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            page_size: 100,
            max_events_per_tick: 0,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoopState::Initializing => "initializing",
            LoopState::Running => "running",
            LoopState::Draining => "draining",
            LoopState::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// Binds a [`ChangeSource`] to a [`ChangeSink`] under a periodic timer.
///
/// Owns the in-memory copy of the continuation token; the durable copy lives
/// in the sink and is never ahead of committed events. Readiness is pushed
/// one-way to the admin surface through a watch channel.
pub struct SyncService<S: ChangeSource> {
    source: S,
    sink: Arc<dyn ChangeSink>,
    options: SyncOptions,
    metrics: Arc<SyncMetrics>,
    shutdown: CancellationToken,
    ready_tx: watch::Sender<bool>,
    state: LoopState,
}

impl<S: ChangeSource> SyncService<S> {
    /// Build the service. The returned receiver reflects readiness: `true`
    /// once the first cursor read succeeds, `false` as soon as draining
    /// starts.
    pub fn new(
        source: S,
        sink: Arc<dyn ChangeSink>,
        options: SyncOptions,
        metrics: Arc<SyncMetrics>,
        shutdown: CancellationToken,
    ) -> (Self, watch::Receiver<bool>) {
        let (ready_tx, ready_rx) = watch::channel(false);
        (
            Self {
                source,
                sink,
                options,
                metrics,
                shutdown,
                ready_tx,
                state: LoopState::Initializing,
            },
            ready_rx,
        )
    }

    fn set_state(&mut self, state: LoopState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "sync loop state transition");
            self.state = state;
        }
    }

    /// Run until shutdown. `Ok(())` is a clean drain; an error is a fatal
    /// runtime failure (the caller maps it to exit code 2).
    pub async fn run(mut self) -> SyncResult<()> {
        let mut token = match self.sink.read_cursor().await {
            Ok(token) => token,
            Err(e) => {
                error!(error = %e, "failed to read the persisted cursor");
                self.drain().await;
                return Err(e);
            }
        };
        info!(token = %token, source = self.source.name(), "starting sync from persisted cursor");

        self.set_state(LoopState::Running);
        let _ = self.ready_tx.send(true);

        let mut interval = tokio::time::interval(self.options.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let fatal = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break None,
                _ = interval.tick() => {
                    match self.sync_once(&mut token).await {
                        Ok(_) => {}
                        Err(SyncError::Cancelled) => break None,
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "fatal pipeline failure");
                            self.metrics.changes_errors.inc();
                            break Some(e);
                        }
                        Err(e) => {
                            warn!(error = %e, code = e.code(), "tick failed, will retry from the same cursor");
                            self.metrics.changes_errors.inc();
                        }
                    }
                }
            }
        };

        self.drain().await;
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One pipeline invocation.
    #[instrument(
        name = "sync.changes",
        skip(self, token),
        fields(
            token_in = %token,
            mode = %self.sink.mode(),
            processed = tracing::field::Empty,
            lag_seconds = tracing::field::Empty,
        )
    )]
    async fn sync_once(&self, token: &mut String) -> SyncResult<usize> {
        let tick_started = Instant::now();

        let mut page_size = self.options.page_size;
        if self.options.max_events_per_tick > 0 {
            page_size = page_size.min(self.options.max_events_per_tick as i32);
        }

        let fetch_started = Instant::now();
        let fetched = self.source.fetch(token, page_size).await;
        let fetch_elapsed = fetch_started.elapsed().as_secs_f64();
        self.metrics
            .source_request_duration_seconds
            .observe(fetch_elapsed);

        let page = match fetched {
            Ok(page) => {
                self.metrics
                    .source_requests
                    .get_or_create(&StatusLabels { status: "success" })
                    .inc();
                self.metrics
                    .last_successful_fetch
                    .set(chrono::Utc::now().timestamp() as f64);
                page
            }
            Err(e) => {
                self.metrics
                    .source_requests
                    .get_or_create(&StatusLabels { status: "error" })
                    .inc();
                self.metrics
                    .sync_duration_seconds
                    .observe(tick_started.elapsed().as_secs_f64());
                return Err(e);
            }
        };

        if page.is_empty() {
            debug!("no new changes");
            self.metrics
                .sync_duration_seconds
                .observe(tick_started.elapsed().as_secs_f64());
            return Ok(0);
        }

        let stats = self.source.stats();
        debug!(
            total_requests = stats.total_requests,
            success_requests = stats.success_requests,
            failed_requests = stats.failed_requests,
            ewma_latency_ms = stats.ewma_latency_ms,
            "fetcher statistics"
        );

        // The sink commits the batch and the cursor as one unit. An empty
        // next token is never saved.
        let next_token = (!page.next_token.is_empty()).then_some(page.next_token.as_str());
        let (operation, written) = match self.sink.mode() {
            SinkMode::Log => (
                "write",
                self.sink.write_log(&page.events, next_token).await,
            ),
            SinkMode::State => (
                "apply",
                self.sink.apply_state(&page.events, next_token).await,
            ),
        };
        self.metrics
            .storage_operations
            .get_or_create(&StorageOpLabels {
                operation,
                status: if written.is_ok() { "success" } else { "error" },
            })
            .inc();
        self.metrics
            .sync_duration_seconds
            .observe(tick_started.elapsed().as_secs_f64());
        written?;

        if let Some(next) = next_token {
            *token = next.to_string();
        }

        self.metrics.changes_processed.inc_by(page.count as u64);

        let lag_seconds = page
            .events
            .iter()
            .filter(|e| !e.timestamp_inferred)
            .map(|e| e.timestamp)
            .max()
            .map(|newest| (chrono::Utc::now() - newest).num_milliseconds() as f64 / 1000.0);
        if let Some(lag) = lag_seconds {
            self.metrics.changes_lag_seconds.set(lag.max(0.0));
        }

        let span = tracing::Span::current();
        span.record("processed", page.count);
        if let Some(lag) = lag_seconds {
            span.record("lag_seconds", lag);
        }

        info!(
            processed = page.count,
            next_token = %page.next_token,
            has_more = page.has_more,
            duration_ms = tick_started.elapsed().as_millis() as u64,
            "processed changes batch"
        );

        Ok(page.count)
    }

    /// Tear down in order: flip readiness, close the sink under the drain
    /// deadline, stop.
    async fn drain(&mut self) {
        self.set_state(LoopState::Draining);
        let _ = self.ready_tx.send(false);

        match tokio::time::timeout(self.options.drain_timeout, self.sink.close()).await {
            Ok(Ok(())) => debug!("sink closed"),
            Ok(Err(e)) => warn!(error = %e, "sink close failed"),
            Err(_) => error!(
                deadline_secs = self.options.drain_timeout.as_secs(),
                "sink close exceeded the drain deadline"
            ),
        }

        self.set_state(LoopState::Stopped);
        info!("sync loop stopped");
    }
}
