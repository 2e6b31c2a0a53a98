//! Replica sink: replays changes into a second instance of the source
//! service.
//!
//! The remote API is not transactional across requests, so the cursor here is
//! an in-memory checkpoint only (the non-durable cursor contract): after a
//! restart `read_cursor` reports the empty token and replay starts from the
//! beginning of the stream.

use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use tuplesync_core::{ChangeEvent, ChangeKind, SyncError, SyncResult};
use tuplesync_fga::{
    ClientCredentials, Credentials, FgaApi, RetryConfig, TupleKeyDelete, TupleKeyWrite,
    WriteCondition,
};

use crate::{mode_mismatch, ChangeSink, SinkMode, SinkStats};

/// Structured DSN blob for the replica sink.
///
/// The DSN is either a compact locator `<endpoint>/<store_id>` or a JSON
/// object carrying the fields below.
#[derive(Debug, Default, Deserialize)]
pub struct ReplicaDsn {
    pub endpoint: String,
    pub store_id: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub oidc: Option<OidcDsn>,
    #[serde(default)]
    pub authorization_model_id: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct OidcDsn {
    pub issuer: String,
    pub audience: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ReplicaDsn {
    /// Parse and validate a DSN string.
    pub fn parse(dsn: &str) -> SyncResult<Self> {
        let parsed = if dsn.trim_start().starts_with('{') {
            serde_json::from_str::<ReplicaDsn>(dsn)
                .map_err(|e| SyncError::config(format!("invalid replica DSN JSON: {e}")))?
        } else {
            // Compact form: split at the last slash so the endpoint may
            // carry a scheme and port.
            let split = dsn
                .rfind('/')
                .filter(|&i| i > 0 && i < dsn.len() - 1)
                .ok_or_else(|| {
                    SyncError::config("replica DSN must be <endpoint>/<store_id> or a JSON object")
                })?;
            ReplicaDsn {
                endpoint: dsn[..split].to_string(),
                store_id: dsn[split + 1..].to_string(),
                ..ReplicaDsn::default()
            }
        };

        if parsed.endpoint.is_empty() || parsed.store_id.is_empty() {
            return Err(SyncError::config(
                "replica DSN requires non-empty endpoint and store_id",
            ));
        }
        if parsed.token.is_some() && parsed.oidc.is_some() {
            return Err(SyncError::config(
                "replica DSN must configure either token or oidc, not both",
            ));
        }
        Ok(parsed)
    }

    fn credentials(&self) -> Credentials {
        if let Some(token) = &self.token {
            return Credentials::ApiToken(SecretString::new(token.clone()));
        }
        if let Some(oidc) = &self.oidc {
            return Credentials::ClientCredentials(ClientCredentials {
                issuer: oidc.issuer.clone(),
                audience: oidc.audience.clone(),
                client_id: oidc.client_id.clone(),
                client_secret: SecretString::new(oidc.client_secret.clone()),
                scopes: oidc.scopes.clone(),
            });
        }
        Credentials::None
    }
}

pub struct FgaSink {
    api: FgaApi,
    mode: SinkMode,
    batch_size: usize,
    retry: RetryConfig,
    last_token: RwLock<String>,
}

impl FgaSink {
    /// Parse the DSN, build the client, and probe the target store.
    pub async fn connect(dsn: &str, mode: SinkMode, default_batch: usize) -> SyncResult<Self> {
        let config = ReplicaDsn::parse(dsn)?;

        let timeout = Duration::from_secs(config.request_timeout_secs.unwrap_or(30));
        let mut retry = RetryConfig::default();
        if let Some(max_retries) = config.max_retries {
            retry.max_retries = max_retries;
        }
        if let Some(delay_ms) = config.retry_delay_ms {
            retry.initial_delay = Duration::from_millis(delay_ms);
        }

        let api = FgaApi::new(
            &config.endpoint,
            &config.store_id,
            config.credentials(),
            timeout,
            config.authorization_model_id.clone(),
        )?;

        api.check_connection().await?;

        let batch_size = config.batch_size.unwrap_or(default_batch).max(1);
        info!(
            store_id = %api.store_id(),
            endpoint = %api.endpoint(),
            mode = %mode,
            batch_size,
            "replica sink ready"
        );

        Ok(Self {
            api,
            mode,
            batch_size,
            retry,
            last_token: RwLock::new(String::new()),
        })
    }

    /// Replay events in source order: chunked by `batch_size`, each chunk
    /// split at operation-kind boundaries so a write and a delete of the same
    /// tuple never land in one request out of order.
    async fn replay(&self, events: &[ChangeEvent]) -> SyncResult<()> {
        for chunk in events.chunks(self.batch_size) {
            self.replay_chunk_with_retry(chunk).await?;
        }
        debug!(events = events.len(), "replayed batch to replica store");
        Ok(())
    }

    async fn replay_chunk_with_retry(&self, chunk: &[ChangeEvent]) -> SyncResult<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.replay_chunk(chunk).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "replica write failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn replay_chunk(&self, chunk: &[ChangeEvent]) -> SyncResult<()> {
        let mut writes: Vec<TupleKeyWrite> = Vec::new();
        let mut deletes: Vec<TupleKeyDelete> = Vec::new();

        for event in chunk {
            match event.kind {
                ChangeKind::TupleWrite => {
                    if !deletes.is_empty() {
                        self.api.write(&[], &deletes).await?;
                        deletes.clear();
                    }
                    writes.push(TupleKeyWrite {
                        user: event.subject(),
                        relation: event.relation.clone(),
                        object: event.object(),
                        condition: parse_condition(event),
                    });
                }
                ChangeKind::TupleDelete => {
                    if !writes.is_empty() {
                        self.api.write(&writes, &[]).await?;
                        writes.clear();
                    }
                    deletes.push(TupleKeyDelete {
                        user: event.subject(),
                        relation: event.relation.clone(),
                        object: event.object(),
                    });
                }
                ChangeKind::TupleChange => {
                    warn!(operation = %event.operation, "unknown operation, skipping");
                }
            }
        }

        self.api.write(&writes, &deletes).await
    }
}

/// Parse a serialized condition into the write payload. A malformed payload
/// or missing name drops the condition with a warning, never the event.
fn parse_condition(event: &ChangeEvent) -> Option<WriteCondition> {
    let raw = event.condition.as_deref()?;
    match serde_json::from_str::<WriteCondition>(raw) {
        Ok(condition) if !condition.name.is_empty() => Some(condition),
        Ok(_) => {
            warn!(condition = raw, "condition has no name, writing without it");
            None
        }
        Err(e) => {
            warn!(condition = raw, error = %e, "malformed condition, writing without it");
            None
        }
    }
}

#[async_trait::async_trait]
impl ChangeSink for FgaSink {
    fn mode(&self) -> SinkMode {
        self.mode
    }

    #[instrument(name = "sink.write_log", skip(self, events), fields(events = events.len()))]
    async fn write_log(&self, events: &[ChangeEvent], next_token: Option<&str>) -> SyncResult<()> {
        if self.mode != SinkMode::Log {
            return Err(mode_mismatch("write_log", self.mode));
        }
        self.replay(events).await?;
        if let Some(token) = next_token {
            *self.last_token.write().await = token.to_string();
        }
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
        self.replay(events).await?;
        if let Some(token) = next_token {
            *self.last_token.write().await = token.to_string();
        }
        Ok(())
    }

    async fn read_cursor(&self) -> SyncResult<String> {
        Ok(self.last_token.read().await.clone())
    }

    async fn save_cursor(&self, token: &str) -> SyncResult<()> {
        *self.last_token.write().await = token.to_string();
        debug!(token, "saved in-memory cursor");
        Ok(())
    }

    async fn stats(&self) -> SyncResult<SinkStats> {
        let mut stats = SinkStats::new("openfga", self.mode);
        stats.last_token = Some(self.last_token.read().await.clone());
        match self.api.check_connection().await {
            Ok(()) => stats.connection_healthy = true,
            Err(e) => stats.connection_error = Some(e.to_string()),
        }
        Ok(stats)
    }

    async fn close(&self) -> SyncResult<()> {
        debug!("closing replica sink");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_locator() {
        let dsn = ReplicaDsn::parse("http://localhost:8080/store-abc").unwrap();
        assert_eq!(dsn.endpoint, "http://localhost:8080");
        assert_eq!(dsn.store_id, "store-abc");
        assert!(dsn.token.is_none());
    }

    #[test]
    fn parses_json_blob() {
        let dsn = ReplicaDsn::parse(
            r#"{
                "endpoint": "https://fga.example.com",
                "store_id": "store-1",
                "token": "secret",
                "authorization_model_id": "01J0MODEL",
                "request_timeout_secs": 10,
                "batch_size": 25
            }"#,
        )
        .unwrap();
        assert_eq!(dsn.endpoint, "https://fga.example.com");
        assert_eq!(dsn.store_id, "store-1");
        assert_eq!(dsn.token.as_deref(), Some("secret"));
        assert_eq!(dsn.authorization_model_id.as_deref(), Some("01J0MODEL"));
        assert_eq!(dsn.batch_size, Some(25));
    }

    #[test]
    fn parses_oidc_blob() {
        let dsn = ReplicaDsn::parse(
            r#"{
                "endpoint": "https://fga.example.com",
                "store_id": "store-1",
                "oidc": {
                    "issuer": "auth.example.com",
                    "audience": "https://fga.example.com",
                    "client_id": "client",
                    "client_secret": "secret",
                    "scopes": ["write:tuples"]
                }
            }"#,
        )
        .unwrap();
        assert!(matches!(
            dsn.credentials(),
            Credentials::ClientCredentials(_)
        ));
    }

    #[test]
    fn rejects_unusable_dsns() {
        assert!(ReplicaDsn::parse("").is_err());
        assert!(ReplicaDsn::parse("no-slash").is_err());
        assert!(ReplicaDsn::parse("trailing/").is_err());
        assert!(ReplicaDsn::parse("/leading").is_err());
        assert!(ReplicaDsn::parse(r#"{"endpoint": "x"}"#).is_err());
        assert!(ReplicaDsn::parse(
            r#"{"endpoint": "x", "store_id": "y", "token": "t",
                "oidc": {"issuer": "i", "audience": "a", "client_id": "c", "client_secret": "s"}}"#
        )
        .is_err());
    }

    fn event_with_condition(condition: Option<&str>) -> ChangeEvent {
        ChangeEvent {
            object_type: "document".to_string(),
            object_id: "x".to_string(),
            relation: "viewer".to_string(),
            subject_type: "user".to_string(),
            subject_id: "alice".to_string(),
            operation: "WRITE".to_string(),
            kind: ChangeKind::TupleWrite,
            timestamp: chrono::Utc::now(),
            timestamp_inferred: false,
            condition: condition.map(str::to_string),
            raw: "{}".to_string(),
        }
    }

    #[test]
    fn condition_parsing_is_best_effort() {
        let ok = event_with_condition(Some(
            r#"{"name":"ip_allowlist","context":{"ips":["10.0.0.1"]}}"#,
        ));
        let parsed = parse_condition(&ok).unwrap();
        assert_eq!(parsed.name, "ip_allowlist");

        assert!(parse_condition(&event_with_condition(None)).is_none());
        assert!(parse_condition(&event_with_condition(Some("not-json"))).is_none());
        assert!(parse_condition(&event_with_condition(Some(r#"{"context":{}}"#))).is_none());
        assert!(parse_condition(&event_with_condition(Some(r#"{"name":""}"#))).is_none());
    }
}
