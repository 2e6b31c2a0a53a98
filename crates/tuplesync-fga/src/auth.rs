//! Credential handling for the source service.
//!
//! Three modes: no authentication, a static bearer token, and an OAuth2
//! client-credentials grant. Grant tokens are cached and refreshed shortly
//! before expiry; a 401 from the API invalidates the cache so the next
//! request acquires a fresh token.

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use tuplesync_core::{SyncError, SyncResult};

/// Client-credentials grant configuration.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    /// Token issuer; a bare host is treated as `https://<host>`.
    pub issuer: String,
    pub audience: String,
    pub client_id: String,
    pub client_secret: SecretString,
    /// Optional scopes, joined with spaces in the token request.
    pub scopes: Vec<String>,
}

impl ClientCredentials {
    /// The token endpoint derived from the issuer.
    #[must_use]
    pub fn token_url(&self) -> String {
        let base = if self.issuer.contains("://") {
            self.issuer.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", self.issuer.trim_end_matches('/'))
        };
        format!("{base}/oauth/token")
    }
}

/// How the client authenticates against the source.
#[derive(Debug)]
pub enum Credentials {
    None,
    ApiToken(SecretString),
    ClientCredentials(ClientCredentials),
}

/// Token response from the issuer.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_expired(&self, grace: Duration) -> bool {
        Utc::now() + grace >= self.expires_at
    }
}

/// Cache for client-credentials access tokens.
pub struct TokenCache {
    credentials: ClientCredentials,
    http: reqwest::Client,
    cached: RwLock<Option<CachedToken>>,
    /// Refresh this long before the reported expiry.
    grace: Duration,
}

impl TokenCache {
    #[must_use]
    pub fn new(credentials: ClientCredentials, http: reqwest::Client) -> Self {
        Self {
            credentials,
            http,
            cached: RwLock::new(None),
            grace: Duration::minutes(5),
        }
    }

    /// Get a valid access token, acquiring a new one if necessary.
    #[instrument(skip(self), fields(client_id = %self.credentials.client_id))]
    pub async fn get_token(&self) -> SyncResult<String> {
        {
            let cache = self.cached.read().await;
            if let Some(ref token) = *cache {
                if !token.is_expired(self.grace) {
                    return Ok(token.access_token.clone());
                }
            }
        }

        debug!("acquiring access token");
        let token = self.acquire_token().await?;
        let access_token = token.access_token.clone();
        *self.cached.write().await = Some(token);
        Ok(access_token)
    }

    /// Drop the cached token so the next use acquires a fresh one.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    async fn acquire_token(&self) -> SyncResult<CachedToken> {
        let mut params = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.credentials.client_id.clone()),
            (
                "client_secret",
                self.credentials.client_secret.expose_secret().to_string(),
            ),
            ("audience", self.credentials.audience.clone()),
        ];
        if !self.credentials.scopes.is_empty() {
            params.push(("scope", self.credentials.scopes.join(" ")));
        }

        let response = self
            .http
            .post(self.credentials.token_url())
            .form(&params)
            .send()
            .await
            .map_err(|e| SyncError::auth_expired(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::auth_expired(format!(
                "token request returned {status}: {body}"
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            SyncError::auth_expired(format!("malformed token response: {e}"))
        })?;

        let expires_at = Utc::now() + Duration::seconds(token.expires_in);
        debug!(%expires_at, "acquired access token");

        Ok(CachedToken {
            access_token: token.access_token,
            expires_at,
        })
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("issuer", &self.credentials.issuer)
            .field("client_id", &self.credentials.client_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> ClientCredentials {
        ClientCredentials {
            issuer: "auth.example.com".to_string(),
            audience: "https://fga.example.com".to_string(),
            client_id: "client".to_string(),
            client_secret: SecretString::new("secret".to_string()),
            scopes: vec![],
        }
    }

    #[test]
    fn token_url_defaults_to_https() {
        assert_eq!(
            credentials().token_url(),
            "https://auth.example.com/oauth/token"
        );
    }

    #[test]
    fn token_url_keeps_explicit_scheme() {
        let mut creds = credentials();
        creds.issuer = "http://localhost:9090/".to_string();
        assert_eq!(creds.token_url(), "http://localhost:9090/oauth/token");
    }

    #[test]
    fn cached_token_expiry_respects_grace() {
        let token = CachedToken {
            access_token: "t".to_string(),
            expires_at: Utc::now() + Duration::minutes(10),
        };
        assert!(!token.is_expired(Duration::minutes(5)));
        assert!(token.is_expired(Duration::minutes(15)));
    }

    #[test]
    fn already_expired_token_is_expired_without_grace() {
        let token = CachedToken {
            access_token: "t".to_string(),
            expires_at: Utc::now() - Duration::minutes(1),
        };
        assert!(token.is_expired(Duration::zero()));
    }
}
