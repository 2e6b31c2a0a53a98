//! Embedded SQLite sink.
//!
//! Single-file store with WAL journaling, or fully in-memory for tests and
//! ephemeral runs. Semantics mirror the Postgres sink: events and cursor
//! commit in one transaction. The pool is pinned to one connection: SQLite
//! has a single writer, and an in-memory database lives and dies with its
//! connection.

use std::collections::BTreeMap;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::QueryBuilder;
use tracing::{debug, info, instrument, warn};

use tuplesync_core::{ChangeEvent, ChangeKind, SyncResult};
use tuplesync_fga::RetryConfig;

use crate::{classify_sqlx, mode_mismatch, ChangeSink, SinkMode, SinkStats};

const SCHEMA_COMMON: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS sync_state (
        id                 INTEGER PRIMARY KEY,
        continuation_token TEXT NOT NULL DEFAULT '',
        updated_at         TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    r"INSERT OR IGNORE INTO sync_state (id, continuation_token) VALUES (1, '')",
];

const SCHEMA_LOG: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS fga_changelog (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        change_kind  TEXT NOT NULL,
        object_type  TEXT NOT NULL,
        object_id    TEXT NOT NULL,
        relation     TEXT NOT NULL,
        subject_type TEXT NOT NULL,
        subject_id   TEXT NOT NULL,
        timestamp    TEXT NOT NULL,
        condition    TEXT,
        raw_event    TEXT NOT NULL,
        inserted_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    r"CREATE INDEX IF NOT EXISTS idx_fga_changelog_timestamp ON fga_changelog(timestamp)",
    r"CREATE INDEX IF NOT EXISTS idx_fga_changelog_subject_type ON fga_changelog(subject_type)",
    r"CREATE INDEX IF NOT EXISTS idx_fga_changelog_object_type ON fga_changelog(object_type)",
    r"CREATE INDEX IF NOT EXISTS idx_fga_changelog_relation ON fga_changelog(relation)",
    r"CREATE INDEX IF NOT EXISTS idx_fga_changelog_change_kind ON fga_changelog(change_kind)",
];

const SCHEMA_STATE: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS fga_tuples (
        object_type  TEXT NOT NULL,
        object_id    TEXT NOT NULL,
        relation     TEXT NOT NULL,
        subject_type TEXT NOT NULL,
        subject_id   TEXT NOT NULL,
        condition    TEXT,
        created_at   TEXT NOT NULL,
        updated_at   TEXT NOT NULL,
        PRIMARY KEY (object_type, object_id, relation, subject_type, subject_id)
    )",
    r"CREATE INDEX IF NOT EXISTS idx_fga_tuples_subject_type ON fga_tuples(subject_type)",
    r"CREATE INDEX IF NOT EXISTS idx_fga_tuples_object_type ON fga_tuples(object_type)",
    r"CREATE INDEX IF NOT EXISTS idx_fga_tuples_relation ON fga_tuples(relation)",
];

pub struct SqliteSink {
    pool: SqlitePool,
    mode: SinkMode,
    batch_size: usize,
    retry: RetryConfig,
}

impl SqliteSink {
    /// Open (or create) the database and initialize the schema.
    ///
    /// Accepted DSNs: `sqlite://<path>`, a bare path, `:memory:`, or
    /// `sqlite::memory:`.
    pub async fn connect(dsn: &str, mode: SinkMode, batch_size: usize) -> SyncResult<Self> {
        let options = if dsn == ":memory:" || dsn == "sqlite::memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| classify_sqlx("invalid sqlite dsn", e))?
        } else {
            let path = dsn.strip_prefix("sqlite://").unwrap_or(dsn);
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .foreign_keys(true)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| classify_sqlx("failed to open sqlite database", e))?;

        let sink = Self {
            pool,
            mode,
            batch_size: batch_size.max(1),
            retry: RetryConfig::default(),
        };
        sink.init_schema().await?;

        info!(mode = %mode, "sqlite sink ready");
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

    async fn retrying<'a, T, F>(&'a self, mut op: impl FnMut(&'a SqlitePool) -> F) -> SyncResult<T>
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
                        "sqlite write failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn write_log_txn(
        pool: &SqlitePool,
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
                    .push_bind(event.timestamp.to_rfc3339())
                    .push_bind(event.condition.as_deref())
                    .push_bind(&event.raw);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx("failed to insert changelog batch", e))?;
        }

        if let Some(token) = next_token {
            save_cursor_in(&mut tx, token).await?;
        }

        tx.commit()
            .await
            .map_err(|e| classify_sqlx("failed to commit changelog batch", e))?;
        Ok(())
    }

    async fn apply_state_txn(
        pool: &SqlitePool,
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
            let now = chrono::Utc::now().to_rfc3339();
            match event.kind {
                ChangeKind::TupleWrite => {
                    sqlx::query(
                        r"INSERT INTO fga_tuples
                          (object_type, object_id, relation, subject_type, subject_id,
                           condition, created_at, updated_at)
                          VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                          ON CONFLICT (object_type, object_id, relation, subject_type, subject_id)
                          DO UPDATE SET condition = excluded.condition,
                                        updated_at = excluded.updated_at",
                    )
                    .bind(&event.object_type)
                    .bind(&event.object_id)
                    .bind(&event.relation)
                    .bind(&event.subject_type)
                    .bind(&event.subject_id)
                    .bind(event.condition.as_deref())
                    .bind(&now)
                    .bind(&now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| classify_sqlx("failed to upsert tuple", e))?;
                    upserts += 1;
                }
                ChangeKind::TupleDelete => {
                    sqlx::query(
                        r"DELETE FROM fga_tuples
                          WHERE object_type = ? AND object_id = ? AND relation = ?
                            AND subject_type = ? AND subject_id = ?",
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
            save_cursor_in(&mut tx, token).await?;
        }

        tx.commit()
            .await
            .map_err(|e| classify_sqlx("failed to commit state batch", e))?;
        Ok((upserts, deletes))
    }
}

async fn save_cursor_in(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    token: &str,
) -> SyncResult<()> {
    sqlx::query(
        "UPDATE sync_state SET continuation_token = ?, updated_at = CURRENT_TIMESTAMP WHERE id = 1",
    )
    .bind(token)
    .execute(&mut **tx)
    .await
    .map_err(|e| tuplesync_core::SyncError::cursor_save_failed("sqlite cursor update", e))?;
    Ok(())
}

#[async_trait::async_trait]
impl ChangeSink for SqliteSink {
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
        sqlx::query(
            "UPDATE sync_state SET continuation_token = ?, updated_at = CURRENT_TIMESTAMP WHERE id = 1",
        )
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(|e| tuplesync_core::SyncError::cursor_save_failed("sqlite cursor update", e))?;
        Ok(())
    }

    async fn stats(&self) -> SyncResult<SinkStats> {
        let mut stats = SinkStats::new("sqlite", self.mode);

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
