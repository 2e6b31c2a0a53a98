//! Polymorphic sinks for materialized change streams.
//!
//! A sink runs in exactly one mode, fixed at construction: `Log` appends
//! every event to an append-only relation, `State` projects events into a
//! current-state relation. Three implementations ship here (Postgres,
//! embedded SQLite, and a replica of the source service), selected by a
//! small factory over the configured backend type.

pub mod fga;
pub mod postgres;
pub mod sqlite;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tuplesync_core::{ChangeEvent, SyncError, SyncResult};

pub use fga::FgaSink;
pub use postgres::PostgresSink;
pub use sqlite::SqliteSink;

/// Materialization discipline, fixed at sink construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkMode {
    /// Append-only event log.
    Log,
    /// Current-state projection via upsert and delete.
    State,
}

impl SinkMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkMode::Log => "log",
            SinkMode::State => "state",
        }
    }
}

impl std::fmt::Display for SinkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SinkMode {
    type Err = String;

    /// Accepts both the short names and the historical config spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "log" | "changelog" => Ok(SinkMode::Log),
            "state" | "stateful" => Ok(SinkMode::State),
            other => Err(format!(
                "unknown sink mode: {other} (expected changelog or stateful)"
            )),
        }
    }
}

/// Which sink implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    Sqlite,
    Fga,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Postgres => "postgres",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Fga => "openfga",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(BackendKind::Postgres),
            "sqlite" => Ok(BackendKind::Sqlite),
            "openfga" | "fga" => Ok(BackendKind::Fga),
            other => Err(format!("unsupported backend type: {other}")),
        }
    }
}

/// Point-in-time sink statistics for the observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct SinkStats {
    pub adapter: &'static str,
    pub mode: SinkMode,
    pub connection_healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_error: Option<String>,
    /// Log mode: total rows in the changelog.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_entries: Option<i64>,
    /// Log mode: row counts by change kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_change_kind: Option<BTreeMap<String, i64>>,
    /// State mode: live tuples in the projection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_tuples: Option<i64>,
    /// State mode: tuple counts by object type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_object_type: Option<BTreeMap<String, i64>>,
    /// Replica sink: the in-memory cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_token: Option<String>,
}

impl SinkStats {
    fn new(adapter: &'static str, mode: SinkMode) -> Self {
        Self {
            adapter,
            mode,
            connection_healthy: false,
            connection_error: None,
            log_entries: None,
            by_change_kind: None,
            live_tuples: None,
            by_object_type: None,
            last_token: None,
        }
    }
}

/// Capability set every sink implements.
///
/// Mode-restricted writes take the page's `next_token` so transactional
/// implementations can commit events and cursor as one unit; a crash between
/// the two is therefore impossible for those sinks. `save_cursor` remains
/// for cursor-only moves.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    /// The discipline this sink was constructed with.
    fn mode(&self) -> SinkMode;

    /// Append events to the log, committing `next_token` in the same unit.
    /// Fails with a mode mismatch unless the sink is in `Log` mode.
    async fn write_log(&self, events: &[ChangeEvent], next_token: Option<&str>) -> SyncResult<()>;

    /// Project events into current state in order, committing `next_token`
    /// in the same unit. Fails with a mode mismatch unless in `State` mode.
    async fn apply_state(&self, events: &[ChangeEvent], next_token: Option<&str>)
        -> SyncResult<()>;

    /// Read the persisted continuation token; empty means "from the
    /// beginning".
    async fn read_cursor(&self) -> SyncResult<String>;

    /// Persist the continuation token on its own.
    async fn save_cursor(&self, token: &str) -> SyncResult<()>;

    /// Current statistics; also used as a connection health probe.
    async fn stats(&self) -> SyncResult<SinkStats>;

    /// Release resources. Idempotent.
    async fn close(&self) -> SyncResult<()>;
}

/// Construct the configured sink.
///
/// `batch_size` bounds write chunks for the relational sinks; the replica
/// sink takes its own batch size from the DSN blob, falling back to this
/// value.
pub async fn create_sink(
    kind: BackendKind,
    dsn: &str,
    mode: SinkMode,
    batch_size: usize,
) -> SyncResult<Arc<dyn ChangeSink>> {
    match kind {
        BackendKind::Postgres => Ok(Arc::new(
            PostgresSink::connect(dsn, mode, batch_size).await?,
        )),
        BackendKind::Sqlite => Ok(Arc::new(SqliteSink::connect(dsn, mode, batch_size).await?)),
        BackendKind::Fga => Ok(Arc::new(FgaSink::connect(dsn, mode, batch_size).await?)),
    }
}

pub(crate) fn mode_mismatch(operation: &'static str, mode: SinkMode) -> SyncError {
    SyncError::SinkModeMismatch {
        operation,
        mode: mode.as_str(),
    }
}

/// Map a sqlx failure onto the taxonomy. Connection-level faults are
/// transient and retried; everything else is a storage error.
pub(crate) fn classify_sqlx(context: &str, error: sqlx::Error) -> SyncError {
    match &error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            SyncError::transient_with_source(format!("{context}: {error}"), error)
        }
        _ => SyncError::database_with_source(format!("{context}: {error}"), error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_mode_accepts_both_spellings() {
        assert_eq!("changelog".parse::<SinkMode>().unwrap(), SinkMode::Log);
        assert_eq!("log".parse::<SinkMode>().unwrap(), SinkMode::Log);
        assert_eq!("stateful".parse::<SinkMode>().unwrap(), SinkMode::State);
        assert_eq!("STATE".parse::<SinkMode>().unwrap(), SinkMode::State);
        assert!("append".parse::<SinkMode>().is_err());
    }

    #[test]
    fn backend_kind_parsing() {
        assert_eq!(
            "postgres".parse::<BackendKind>().unwrap(),
            BackendKind::Postgres
        );
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::Sqlite);
        assert_eq!("openfga".parse::<BackendKind>().unwrap(), BackendKind::Fga);
        assert!("mysql".parse::<BackendKind>().is_err());
    }

    #[test]
    fn mode_mismatch_is_fatal() {
        let err = mode_mismatch("write_log", SinkMode::State);
        assert!(err.is_fatal());
        assert_eq!(err.code(), "SINK_MODE_MISMATCH");
    }

    #[test]
    fn stats_serialization_omits_absent_sections() {
        let stats = SinkStats::new("sqlite", SinkMode::Log);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["adapter"], "sqlite");
        assert_eq!(json["mode"], "log");
        assert!(json.get("live_tuples").is_none());
        assert!(json.get("last_token").is_none());
    }
}
