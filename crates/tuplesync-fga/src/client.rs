//! Raw HTTP API surface of the source service.
//!
//! Thin request/response layer: it injects credentials, classifies failures
//! into the shared error taxonomy, and performs a single in-band credential
//! refresh on 401. Retry with backoff lives one level up in the fetcher and
//! the replica sink.

use std::time::Duration;

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tuplesync_core::{SyncError, SyncResult};

use crate::auth::{Credentials, TokenCache};

/// Wire page returned by the change-stream endpoint.
///
/// Records are kept as raw JSON values; parsing into [`ChangeEvent`]s is the
/// job of [`crate::parse`], which tolerates malformed entries.
///
/// [`ChangeEvent`]: tuplesync_core::ChangeEvent
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadChangesPage {
    #[serde(default)]
    pub changes: Vec<serde_json::Value>,
    #[serde(default)]
    pub continuation_token: Option<String>,
}

/// A tuple write destined for the replica store.
#[derive(Debug, Clone, Serialize)]
pub struct TupleKeyWrite {
    pub user: String,
    pub relation: String,
    pub object: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<WriteCondition>,
}

/// A tuple delete; the API accepts no condition on deletes.
#[derive(Debug, Clone, Serialize)]
pub struct TupleKeyDelete {
    pub user: String,
    pub relation: String,
    pub object: String,
}

/// Condition payload attached to a tuple write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteCondition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct WriteBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    writes: Option<TupleKeys<&'a [TupleKeyWrite]>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deletes: Option<TupleKeys<&'a [TupleKeyDelete]>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    authorization_model_id: Option<&'a str>,
}

#[derive(Serialize)]
struct TupleKeys<T> {
    tuple_keys: T,
}

enum AuthMode {
    None,
    Bearer(SecretString),
    Oidc(TokenCache),
}

/// Client for one store of the source service.
pub struct FgaApi {
    http: reqwest::Client,
    endpoint: String,
    store_id: String,
    auth: AuthMode,
    authorization_model_id: Option<String>,
}

impl FgaApi {
    /// Build a client. Fails fast on an unusable endpoint or HTTP stack.
    pub fn new(
        endpoint: &str,
        store_id: &str,
        credentials: Credentials,
        request_timeout: Duration,
        authorization_model_id: Option<String>,
    ) -> SyncResult<Self> {
        if endpoint.is_empty() {
            return Err(SyncError::config("source endpoint must not be empty"));
        }
        if store_id.is_empty() {
            return Err(SyncError::config("source store id must not be empty"));
        }

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::config(format!("failed to build http client: {e}")))?;

        let auth = match credentials {
            Credentials::None => AuthMode::None,
            Credentials::ApiToken(token) => AuthMode::Bearer(token),
            Credentials::ClientCredentials(creds) => {
                AuthMode::Oidc(TokenCache::new(creds, http.clone()))
            }
        };

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            store_id: store_id.to_string(),
            auth,
            authorization_model_id,
        })
    }

    #[must_use]
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Fetch one page of the change stream.
    pub async fn read_changes(
        &self,
        continuation_token: &str,
        page_size: i32,
    ) -> SyncResult<ReadChangesPage> {
        let url = format!("{}/stores/{}/changes", self.endpoint, self.store_id);
        let mut query: Vec<(&str, String)> = Vec::new();
        if page_size > 0 {
            query.push(("page_size", page_size.to_string()));
        }
        if !continuation_token.is_empty() {
            query.push(("continuation_token", continuation_token.to_string()));
        }

        let response = self
            .execute(|| self.http.get(&url).query(&query))
            .await?;
        response
            .json::<ReadChangesPage>()
            .await
            .map_err(|e| SyncError::serialization(format!("malformed changes page: {e}")))
    }

    /// Apply tuple writes and deletes to the store.
    pub async fn write(
        &self,
        writes: &[TupleKeyWrite],
        deletes: &[TupleKeyDelete],
    ) -> SyncResult<()> {
        if writes.is_empty() && deletes.is_empty() {
            return Ok(());
        }

        let url = format!("{}/stores/{}/write", self.endpoint, self.store_id);
        let body = WriteBody {
            writes: (!writes.is_empty()).then_some(TupleKeys { tuple_keys: writes }),
            deletes: (!deletes.is_empty()).then_some(TupleKeys {
                tuple_keys: deletes,
            }),
            authorization_model_id: self.authorization_model_id.as_deref(),
        };

        self.execute(|| self.http.post(&url).json(&body)).await?;
        debug!(
            writes = writes.len(),
            deletes = deletes.len(),
            "applied tuple batch"
        );
        Ok(())
    }

    /// Cheap connectivity probe against the store.
    pub async fn check_connection(&self) -> SyncResult<()> {
        let url = format!("{}/stores/{}/read", self.endpoint, self.store_id);
        self.execute(|| self.http.post(&url).json(&serde_json::json!({})))
            .await?;
        Ok(())
    }

    /// Send a request with credentials attached. On 401 the cached grant
    /// token is invalidated and the request retried exactly once.
    async fn execute<F>(&self, build: F) -> SyncResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let response = self.send_with_auth(&build).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::check_status(response).await;
        }

        match &self.auth {
            AuthMode::Oidc(cache) => {
                warn!("source returned 401, refreshing credentials and retrying once");
                cache.invalidate().await;
                let retried = self.send_with_auth(&build).await?;
                Self::check_status(retried).await
            }
            _ => Err(SyncError::auth_expired(
                "source rejected the configured credentials",
            )),
        }
    }

    async fn send_with_auth<F>(&self, build: &F) -> SyncResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut request = build();
        match &self.auth {
            AuthMode::None => {}
            AuthMode::Bearer(token) => {
                request = request.bearer_auth(token.expose_secret());
            }
            AuthMode::Oidc(cache) => {
                request = request.bearer_auth(cache.get_token().await?);
            }
        }
        request.send().await.map_err(classify_reqwest)
    }

    async fn check_status(response: reqwest::Response) -> SyncResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            return Err(SyncError::auth_expired(message));
        }
        Err(SyncError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

impl std::fmt::Debug for FgaApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FgaApi")
            .field("endpoint", &self.endpoint)
            .field("store_id", &self.store_id)
            .finish_non_exhaustive()
    }
}

/// Map a transport-level failure onto the error taxonomy. Timeouts and
/// connection faults are transient; everything else is internal.
fn classify_reqwest(error: reqwest::Error) -> SyncError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        SyncError::transient_with_source(format!("source request failed: {error}"), error)
    } else {
        SyncError::internal(format!("source request failed: {error}"))
    }
}
