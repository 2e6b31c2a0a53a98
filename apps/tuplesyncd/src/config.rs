//! Daemon configuration loaded from environment variables.
//!
//! Fail-fast: every variable is parsed and cross-validated before any
//! component constructs, and the process exits with code 1 on the first
//! problem.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

use tuplesync_fga::{ClientCredentials, Credentials, FetchOptions, RetryConfig};
use tuplesync_store::{BackendKind, SinkMode};
use tuplesync_sync::SyncOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {var}")]
    Missing { var: &'static str },

    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },

    #[error("configuration error: {message}")]
    Conflict { message: String },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected text or json, got {other}")),
        }
    }
}

/// OIDC client-credentials settings for the source.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub audience: String,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
}

/// Complete daemon configuration.
#[derive(Debug)]
pub struct Config {
    // Source service
    pub source_endpoint: String,
    pub source_store_id: String,
    pub source_token: Option<String>,
    pub source_oidc: Option<OidcConfig>,

    // Sink
    pub backend_type: BackendKind,
    pub backend_dsn: String,
    pub sink_mode: SinkMode,
    pub sink_batch_size: usize,

    // Service
    pub poll_interval: Duration,
    pub page_size: i32,
    pub max_events_per_tick: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub backoff_factor: f64,
    pub request_timeout: Duration,
    pub rate_limit_delay: Duration,
    pub enable_validation: bool,

    // Admin surface
    pub server_port: u16,
    pub metrics_enabled: bool,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    match env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing { var }),
    }
}

fn optional(var: &'static str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional(var) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

impl Config {
    /// Load and validate from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let source_oidc = match optional("OPENFGA_OIDC_CLIENT_ID") {
            Some(client_id) => Some(OidcConfig {
                issuer: optional("OPENFGA_OIDC_ISSUER").unwrap_or_default(),
                audience: optional("OPENFGA_OIDC_AUDIENCE").unwrap_or_default(),
                client_id,
                client_secret: optional("OPENFGA_OIDC_CLIENT_SECRET").unwrap_or_default(),
                scopes: optional("OPENFGA_OIDC_SCOPES")
                    .map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
                    .unwrap_or_default(),
            }),
            None => None,
        };

        let config = Self {
            source_endpoint: required("OPENFGA_ENDPOINT")?,
            source_store_id: required("OPENFGA_STORE_ID")?,
            source_token: optional("OPENFGA_TOKEN"),
            source_oidc,

            backend_type: parsed("BACKEND_TYPE", BackendKind::Postgres)?,
            backend_dsn: required("BACKEND_DSN")?,
            sink_mode: parsed("BACKEND_MODE", SinkMode::Log)?,
            sink_batch_size: parsed("SINK_BATCH_SIZE", 100usize)?,

            poll_interval: Duration::from_secs(parsed("POLL_INTERVAL_SECS", 5u64)?),
            page_size: parsed("PAGE_SIZE", 100i32)?,
            max_events_per_tick: parsed("MAX_EVENTS_PER_TICK", 0usize)?,
            max_retries: parsed("MAX_RETRIES", 3u32)?,
            retry_delay: Duration::from_millis(parsed("RETRY_DELAY_MS", 1000u64)?),
            max_retry_delay: Duration::from_millis(parsed("MAX_RETRY_DELAY_MS", 5000u64)?),
            backoff_factor: parsed("BACKOFF_FACTOR", 2.0f64)?,
            request_timeout: Duration::from_secs(parsed("REQUEST_TIMEOUT_SECS", 30u64)?),
            rate_limit_delay: Duration::from_millis(parsed("RATE_LIMIT_DELAY_MS", 50u64)?),
            enable_validation: parsed("ENABLE_VALIDATION", true)?,

            server_port: parsed("SERVER_PORT", 8080u16)?,
            metrics_enabled: parsed("METRICS_ENABLED", true)?,

            log_level: optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format: parsed("LOG_FORMAT", LogFormat::Text)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let has_token = self.source_token.is_some();
        let has_oidc = self
            .source_oidc
            .as_ref()
            .is_some_and(|o| !o.client_id.is_empty() && !o.client_secret.is_empty());

        if has_token && has_oidc {
            return Err(ConfigError::Conflict {
                message: "configure either OPENFGA_TOKEN or the OIDC client, not both".to_string(),
            });
        }
        if let Some(oidc) = &self.source_oidc {
            if oidc.client_secret.is_empty() {
                return Err(ConfigError::Missing {
                    var: "OPENFGA_OIDC_CLIENT_SECRET",
                });
            }
            if oidc.issuer.is_empty() {
                return Err(ConfigError::Missing {
                    var: "OPENFGA_OIDC_ISSUER",
                });
            }
            if oidc.audience.is_empty() {
                return Err(ConfigError::Missing {
                    var: "OPENFGA_OIDC_AUDIENCE",
                });
            }
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "POLL_INTERVAL_SECS",
                message: "must be positive".to_string(),
            });
        }
        if self.page_size <= 0 {
            return Err(ConfigError::Invalid {
                var: "PAGE_SIZE",
                message: "must be positive".to_string(),
            });
        }
        if self.backoff_factor <= 0.0 {
            return Err(ConfigError::Invalid {
                var: "BACKOFF_FACTOR",
                message: "must be positive".to_string(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                var: "REQUEST_TIMEOUT_SECS",
                message: "must be positive".to_string(),
            });
        }
        if self.sink_batch_size == 0 {
            return Err(ConfigError::Invalid {
                var: "SINK_BATCH_SIZE",
                message: "must be positive".to_string(),
            });
        }

        Ok(())
    }

    /// Source credentials in the client's terms.
    pub fn credentials(&self) -> Credentials {
        if let Some(token) = &self.source_token {
            return Credentials::ApiToken(SecretString::new(token.clone()));
        }
        if let Some(oidc) = &self.source_oidc {
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

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            page_size: self.page_size,
            retry: RetryConfig {
                max_retries: self.max_retries,
                initial_delay: self.retry_delay,
                max_delay: self.max_retry_delay,
                backoff_factor: self.backoff_factor,
            },
            rate_limit_delay: self.rate_limit_delay,
            enable_validation: self.enable_validation,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            poll_interval: self.poll_interval,
            page_size: self.page_size,
            max_events_per_tick: self.max_events_per_tick,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            source_endpoint: "http://localhost:8080".to_string(),
            source_store_id: "store-1".to_string(),
            source_token: Some("token".to_string()),
            source_oidc: None,
            backend_type: BackendKind::Sqlite,
            backend_dsn: ":memory:".to_string(),
            sink_mode: SinkMode::Log,
            sink_batch_size: 100,
            poll_interval: Duration::from_secs(5),
            page_size: 100,
            max_events_per_tick: 0,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_millis(5000),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(30),
            rate_limit_delay: Duration::from_millis(50),
            enable_validation: true,
            server_port: 8080,
            metrics_enabled: true,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }

    #[test]
    fn base_config_is_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn token_and_oidc_conflict() {
        let mut config = base_config();
        config.source_oidc = Some(OidcConfig {
            issuer: "auth.example.com".to_string(),
            audience: "aud".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            scopes: vec![],
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Conflict { .. })
        ));
    }

    #[test]
    fn oidc_requires_issuer_and_audience() {
        let mut config = base_config();
        config.source_token = None;
        config.source_oidc = Some(OidcConfig {
            issuer: String::new(),
            audience: "aud".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            scopes: vec![],
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing {
                var: "OPENFGA_OIDC_ISSUER"
            })
        ));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut config = base_config();
        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.page_size = 0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.backoff_factor = 0.0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.sink_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn fetch_options_carry_retry_bounds() {
        let mut config = base_config();
        config.max_retries = 7;
        config.retry_delay = Duration::from_millis(10);
        let options = config.fetch_options();
        assert_eq!(options.retry.max_retries, 7);
        assert_eq!(options.retry.initial_delay, Duration::from_millis(10));
        assert_eq!(options.page_size, 100);
    }

    // Environment-backed tests serialize on this lock; the process
    // environment is shared state.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "OPENFGA_ENDPOINT",
        "OPENFGA_STORE_ID",
        "OPENFGA_TOKEN",
        "OPENFGA_OIDC_ISSUER",
        "OPENFGA_OIDC_AUDIENCE",
        "OPENFGA_OIDC_CLIENT_ID",
        "OPENFGA_OIDC_CLIENT_SECRET",
        "OPENFGA_OIDC_SCOPES",
        "BACKEND_TYPE",
        "BACKEND_DSN",
        "BACKEND_MODE",
        "SINK_BATCH_SIZE",
        "POLL_INTERVAL_SECS",
        "PAGE_SIZE",
        "MAX_EVENTS_PER_TICK",
        "MAX_RETRIES",
        "RETRY_DELAY_MS",
        "MAX_RETRY_DELAY_MS",
        "BACKOFF_FACTOR",
        "REQUEST_TIMEOUT_SECS",
        "RATE_LIMIT_DELAY_MS",
        "ENABLE_VALIDATION",
        "SERVER_PORT",
        "METRICS_ENABLED",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    fn with_env<R>(vars: &[(&str, &str)], body: impl FnOnce() -> R) -> R {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        for var in ALL_VARS {
            env::remove_var(var);
        }
        for (key, value) in vars {
            env::set_var(key, value);
        }
        let result = body();
        for var in ALL_VARS {
            env::remove_var(var);
        }
        result
    }

    #[test]
    fn from_env_applies_defaults() {
        with_env(
            &[
                ("OPENFGA_ENDPOINT", "http://localhost:8080"),
                ("OPENFGA_STORE_ID", "store-1"),
                ("OPENFGA_TOKEN", "dev-token"),
                ("BACKEND_DSN", ":memory:"),
                ("BACKEND_TYPE", "sqlite"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.poll_interval, Duration::from_secs(5));
                assert_eq!(config.page_size, 100);
                assert_eq!(config.max_retries, 3);
                assert_eq!(config.sink_mode, SinkMode::Log);
                assert_eq!(config.server_port, 8080);
                assert!(config.enable_validation);
                assert!(config.metrics_enabled);
                assert_eq!(config.log_level, "info");
                assert_eq!(config.log_format, LogFormat::Text);
            },
        );
    }

    #[test]
    fn from_env_honors_overrides() {
        with_env(
            &[
                ("OPENFGA_ENDPOINT", "https://fga.example.com"),
                ("OPENFGA_STORE_ID", "store-2"),
                ("OPENFGA_TOKEN", "t"),
                ("BACKEND_DSN", "postgres://localhost/fga"),
                ("BACKEND_MODE", "stateful"),
                ("POLL_INTERVAL_SECS", "30"),
                ("PAGE_SIZE", "250"),
                ("RATE_LIMIT_DELAY_MS", "0"),
                ("LOG_FORMAT", "json"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.sink_mode, SinkMode::State);
                assert_eq!(config.backend_type, BackendKind::Postgres);
                assert_eq!(config.poll_interval, Duration::from_secs(30));
                assert_eq!(config.page_size, 250);
                assert_eq!(config.rate_limit_delay, Duration::ZERO);
                assert_eq!(config.log_format, LogFormat::Json);
            },
        );
    }

    #[test]
    fn from_env_requires_the_source_coordinates() {
        with_env(&[("BACKEND_DSN", ":memory:")], || {
            assert!(matches!(
                Config::from_env(),
                Err(ConfigError::Missing {
                    var: "OPENFGA_ENDPOINT"
                })
            ));
        });
    }

    #[test]
    fn from_env_parses_oidc_scopes() {
        with_env(
            &[
                ("OPENFGA_ENDPOINT", "http://localhost:8080"),
                ("OPENFGA_STORE_ID", "store-1"),
                ("OPENFGA_OIDC_ISSUER", "auth.example.com"),
                ("OPENFGA_OIDC_AUDIENCE", "https://fga.example.com"),
                ("OPENFGA_OIDC_CLIENT_ID", "client"),
                ("OPENFGA_OIDC_CLIENT_SECRET", "secret"),
                ("OPENFGA_OIDC_SCOPES", "read:changes, write:tuples"),
                ("BACKEND_DSN", ":memory:"),
                ("BACKEND_TYPE", "sqlite"),
            ],
            || {
                let config = Config::from_env().unwrap();
                let oidc = config.source_oidc.as_ref().unwrap();
                assert_eq!(oidc.scopes, vec!["read:changes", "write:tuples"]);
                assert!(matches!(
                    config.credentials(),
                    Credentials::ClientCredentials(_)
                ));
            },
        );
    }

    #[test]
    fn credentials_reflect_the_configured_mode() {
        let config = base_config();
        assert!(matches!(config.credentials(), Credentials::ApiToken(_)));

        let mut config = base_config();
        config.source_token = None;
        assert!(matches!(config.credentials(), Credentials::None));
    }
}
