//! PostgreSQL sink.
//!
//! Batch writes and the continuation token commit in one transaction, so a
//! crash can never separate committed events from their cursor. Transient
//! connection faults retry the whole transaction with exponential backoff.

use std::collections::BTreeMap;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::QueryBuilder;
use tracing::{debug, info, instrument, warn};

use tuplesync_core::{ChangeEvent, ChangeKind, SyncResult};
use tuplesync_fga::RetryConfig;

use crate::{classify_sqlx, mode_mismatch, ChangeSink, SinkMode, SinkStats};

const SCHEMA_COMMON: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS sync_state (
        id                 INTEGER PRIMARY KEY,
        continuation_token TEXT NOT NULL DEFAULT '',
        updated_at         TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    r"INSERT INTO sync_state (id, continuation_token)
      VALUES (1, '') ON CONFLICT (id) DO NOTHING",
];

const SCHEMA_LOG: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS fga_changelog (
        id           BIGSERIAL PRIMARY KEY,
        change_kind  VARCHAR(20) NOT NULL,
        object_type  VARCHAR(100) NOT NULL,
        object_id    VARCHAR(255) NOT NULL,
        relation     VARCHAR(100) NOT NULL,
        subject_type VARCHAR(100) NOT NULL,
        subject_id   VARCHAR(255) NOT NULL,
        timestamp    TIMESTAMPTZ NOT NULL,
        condition    JSONB,
        raw_event    TEXT NOT NULL,
        inserted_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    r"CREATE INDEX IF NOT EXISTS idx_fga_changelog_timestamp ON fga_changelog(timestamp)",
    r"CREATE INDEX IF NOT EXISTS idx_fga_changelog_subject_type ON fga_changelog(subject_type)",
    r"CREATE INDEX IF NOT EXISTS idx_fga_changelog_object_type ON fga_changelog(object_type)",
    r"CREATE INDEX IF NOT EXISTS idx_fga_changelog_relation ON fga_changelog(relation)",
    r"CREATE INDEX IF NOT EXISTS idx_fga_changelog_change_kind ON fga_changelog(change_kind)",
];

const SCHEMA_STATE: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS fga_tuples (
        object_type  VARCHAR(100) NOT NULL,
        object_id    VARCHAR(255) NOT NULL,
        relation     VARCHAR(100) NOT NULL,
        subject_type VARCHAR(100) NOT NULL,
        subject_id   VARCHAR(255) NOT NULL,
        condition    JSONB,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (object_type, object_id, relation, subject_type, subject_id)
    )",
    r"CREATE INDEX IF NOT EXISTS idx_fga_tuples_subject_type ON fga_tuples(subject_type)",
    r"CREATE INDEX IF NOT EXISTS idx_fga_tuples_object_type ON fga_tuples(object_type)",
    r"CREATE INDEX IF NOT EXISTS idx_fga_tuples_relation ON fga_tuples(relation)",
];

pub struct PostgresSink {
    pool: PgPool,
    mode: SinkMode,
    batch_size: usize,
    retry: RetryConfig,
}

impl PostgresSink {
    /// Connect and initialize the mode-specific schema.
    pub async fn connect(dsn: &str, mode: SinkMode, batch_size: usize) -> SyncResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(dsn)
            .await
            .map_err(|e| classify_sqlx("failed to connect to postgres", e))?;

        let sink = Self {
            pool,
            mode,
            batch_size: batch_size.max(1),
            retry: RetryConfig::default(),
        };
        sink.init_schema().await?;

        info!(mode = %mode, "postgres sink ready");
        Ok(sink)
    }

    async fn init_schema(&self) -> SyncResult<()> {
        let mode_schema = match self.mode {
            SinkMode::Log => SCHEMA_LOG,
            SinkMode::State => SCHEMA_STATE,
        };
        for statement in SCHEMA_COMMON.iter().chain(mode_schema) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| classify_sqlx("schema initialization failed", e))?;
        }
        Ok(())
    }

    /// Run `op` with transaction-level retry on transient faults.
    async fn retrying<'a, T, F>(&'a self, mut op: impl FnMut(&'a PgPool) -> F) -> SyncResult<T>
    where
        F: std::future::Future<Output = SyncResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op(&self.pool).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "postgres write failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn write_log_txn(
        pool: &PgPool,
        events: &[ChangeEvent],
        next_token: Option<&str>,
        batch_size: usize,
    ) -> SyncResult<()> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| classify_sqlx("failed to begin transaction", e))?;

        for chunk in events.chunks(batch_size) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO fga_changelog \
                 (change_kind, object_type, object_id, relation, subject_type, subject_id, \
                  timestamp, condition, raw_event) ",
            );
            builder.push_values(chunk, |mut row, event| {
                row.push_bind(event.kind.as_str())
                    .push_bind(&event.object_type)
                    .push_bind(&event.object_id)
                    .push_bind(&event.relation)
                    .push_bind(&event.subject_type)
                    .push_bind(&event.subject_id)
                    .push_bind(event.timestamp)
                    .push_bind(condition_json(event))
                    .push_bind(&event.raw);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx("failed to insert changelog batch", e))?;
        }

        if let Some(token) = next_token {
            save_cursor_in(&mut *tx, token).await?;
        }

        tx.commit()
            .await
            .map_err(|e| classify_sqlx("failed to commit changelog batch", e))?;
        Ok(())
    }

    async fn apply_state_txn(
        pool: &PgPool,
        events: &[ChangeEvent],
        next_token: Option<&str>,
    ) -> SyncResult<(usize, usize)> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| classify_sqlx("failed to begin transaction", e))?;

        let mut upserts = 0usize;
        let mut deletes = 0usize;
        for event in events {
            match event.kind {
                ChangeKind::TupleWrite => {
                    sqlx::query(
                        r"INSERT INTO fga_tuples
                          (object_type, object_id, relation, subject_type, subject_id, condition)
                          VALUES ($1, $2, $3, $4, $5, $6)
                          ON CONFLICT (object_type, object_id, relation, subject_type, subject_id)
                          DO UPDATE SET condition = EXCLUDED.condition, updated_at = NOW()",
                    )
                    .bind(&event.object_type)
                    .bind(&event.object_id)
                    .bind(&event.relation)
                    .bind(&event.subject_type)
                    .bind(&event.subject_id)
                    .bind(condition_json(event))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| classify_sqlx("failed to upsert tuple", e))?;
                    upserts += 1;
                }
                ChangeKind::TupleDelete => {
                    sqlx::query(
                        r"DELETE FROM fga_tuples
                          WHERE object_type = $1 AND object_id = $2 AND relation = $3
                            AND subject_type = $4 AND subject_id = $5",
                    )
                    .bind(&event.object_type)
                    .bind(&event.object_id)
                    .bind(&event.relation)
                    .bind(&event.subject_type)
                    .bind(&event.subject_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| classify_sqlx("failed to delete tuple", e))?;
                    deletes += 1;
                }
                ChangeKind::TupleChange => {
                    warn!(operation = %event.operation, "unknown operation, skipping in state mode");
                }
            }
        }

        if let Some(token) = next_token {
            save_cursor_in(&mut *tx, token).await?;
        }

        tx.commit()
            .await
            .map_err(|e| classify_sqlx("failed to commit state batch", e))?;
        Ok((upserts, deletes))
    }
}

/// Conditions are stored as JSONB; the serialized payload is opaque but
/// queryable downstream.
fn condition_json(event: &ChangeEvent) -> Option<serde_json::Value> {
    event
        .condition
        .as_deref()
        .and_then(|c| serde_json::from_str(c).ok())
}

async fn save_cursor_in<'e, E>(executor: E, token: &str) -> SyncResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query("UPDATE sync_state SET continuation_token = $1, updated_at = NOW() WHERE id = 1")
        .bind(token)
        .execute(executor)
        .await
        .map_err(|e| tuplesync_core::SyncError::cursor_save_failed("postgres cursor update", e))?;
    Ok(())
}

#[async_trait::async_trait]
impl ChangeSink for PostgresSink {
    fn mode(&self) -> SinkMode {
        self.mode
    }

    #[instrument(name = "sink.write_log", skip(self, events), fields(events = events.len()))]
    async fn write_log(&self, events: &[ChangeEvent], next_token: Option<&str>) -> SyncResult<()> {
        if self.mode != SinkMode::Log {
            return Err(mode_mismatch("write_log", self.mode));
        }
        if events.is_empty() && next_token.is_none() {
            return Ok(());
        }

        let batch_size = self.batch_size;
        self.retrying(|pool| Self::write_log_txn(pool, events, next_token, batch_size))
            .await?;
        debug!(events = events.len(), "changelog batch committed");
        Ok(())
    }

    #[instrument(name = "sink.apply_state", skip(self, events), fields(events = events.len()))]
    async fn apply_state(
        &self,
        events: &[ChangeEvent],
        next_token: Option<&str>,
    ) -> SyncResult<()> {
        if self.mode != SinkMode::State {
            return Err(mode_mismatch("apply_state", self.mode));
        }
        if events.is_empty() && next_token.is_none() {
            return Ok(());
        }

        let (upserts, deletes) = self
            .retrying(|pool| Self::apply_state_txn(pool, events, next_token))
            .await?;
        debug!(upserts, deletes, "state batch committed");
        Ok(())
    }

    async fn read_cursor(&self) -> SyncResult<String> {
        let token: Option<String> =
            sqlx::query_scalar("SELECT continuation_token FROM sync_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| classify_sqlx("failed to read cursor", e))?;
        Ok(token.unwrap_or_default())
    }

    async fn save_cursor(&self, token: &str) -> SyncResult<()> {
        save_cursor_in(&self.pool, token).await
    }

    async fn stats(&self) -> SyncResult<SinkStats> {
        let mut stats = SinkStats::new("postgres", self.mode);

        if let Err(e) = sqlx::query("SELECT 1").execute(&self.pool).await {
            stats.connection_error = Some(e.to_string());
            return Ok(stats);
        }
        stats.connection_healthy = true;

        match self.mode {
            SinkMode::Log => {
                stats.log_entries = Some(
                    sqlx::query_scalar("SELECT COUNT(*) FROM fga_changelog")
                        .fetch_one(&self.pool)
                        .await
                        .map_err(|e| classify_sqlx("failed to count changelog", e))?,
                );
                let rows: Vec<(String, i64)> = sqlx::query_as(
                    "SELECT change_kind, COUNT(*) FROM fga_changelog GROUP BY change_kind",
                )
                .fetch_all(&self.pool)
                .await
                .map_err(|e| classify_sqlx("failed to group changelog", e))?;
                stats.by_change_kind = Some(rows.into_iter().collect::<BTreeMap<_, _>>());
            }
            SinkMode::State => {
                stats.live_tuples = Some(
                    sqlx::query_scalar("SELECT COUNT(*) FROM fga_tuples")
                        .fetch_one(&self.pool)
                        .await
                        .map_err(|e| classify_sqlx("failed to count tuples", e))?,
                );
                let rows: Vec<(String, i64)> = sqlx::query_as(
                    "SELECT object_type, COUNT(*) FROM fga_tuples GROUP BY object_type",
                )
                .fetch_all(&self.pool)
                .await
                .map_err(|e| classify_sqlx("failed to group tuples", e))?;
                stats.by_object_type = Some(rows.into_iter().collect::<BTreeMap<_, _>>());
            }
        }

        Ok(stats)
    }

    async fn close(&self) -> SyncResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
