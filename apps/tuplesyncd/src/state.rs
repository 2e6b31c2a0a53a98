//! Shared state for the admin HTTP surface.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use prometheus_client::registry::Registry;
use tokio::sync::watch;

/// Handed to every admin handler. Readiness arrives as a one-way push from
/// the sync loop; the handlers only ever read it.
#[derive(Clone)]
pub struct AppState {
    pub started_at: Instant,
    pub version: &'static str,
    pub ready: watch::Receiver<bool>,
    pub registry: Arc<Mutex<Registry>>,
    pub backend_type: &'static str,
    pub sink_mode: &'static str,
    pub poll_interval_secs: u64,
}

impl AppState {
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }
}
