//! The periodic sync pipeline and its observability surface.

pub mod metrics;
pub mod service;

pub use metrics::SyncMetrics;
pub use service::{LoopState, SyncOptions, SyncService};
