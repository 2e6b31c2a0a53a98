//! HTTP-level tests for the change fetcher against a mock source service.

use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tuplesync_core::{ChangeKind, ChangeSource, SyncError};
use tuplesync_fga::{
    ChangeFetcher, ClientCredentials, Credentials, FetchOptions, FgaApi, RetryConfig,
};

fn fast_options() -> FetchOptions {
    FetchOptions {
        page_size: 100,
        retry: RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
        },
        rate_limit_delay: Duration::ZERO,
        enable_validation: true,
    }
}

fn fetcher(server_uri: &str, credentials: Credentials) -> ChangeFetcher {
    let api = FgaApi::new(
        server_uri,
        "store-1",
        credentials,
        Duration::from_secs(5),
        None,
    )
    .unwrap();
    ChangeFetcher::new(api, fast_options(), CancellationToken::new())
}

fn change_record(user: &str, object: &str, operation: &str) -> serde_json::Value {
    json!({
        "tuple_key": {"user": user, "relation": "viewer", "object": object},
        "operation": operation,
        "timestamp": "2024-03-01T12:00:00Z"
    })
}

#[tokio::test]
async fn fetches_and_parses_a_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stores/store-1/changes"))
        .and(query_param("continuation_token", "tok-in"))
        .and(query_param("page_size", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [
                change_record("user:alice", "document:readme", "WRITE"),
                change_record("user:bob", "document:readme", "DELETE"),
            ],
            "continuation_token": "tok-out"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fetcher(&server.uri(), Credentials::None);
    let page = fetcher.fetch("tok-in", 50).await.unwrap();

    assert_eq!(page.count, 2);
    assert_eq!(page.next_token, "tok-out");
    assert!(page.has_more);
    assert_eq!(page.events[0].subject_id, "alice");
    assert_eq!(page.events[0].kind, ChangeKind::TupleWrite);
    assert_eq!(page.events[1].kind, ChangeKind::TupleDelete);

    let stats = fetcher.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.success_requests, 1);
    assert_eq!(stats.total_events, 2);
}

#[tokio::test]
async fn transient_failures_are_retried_exactly_max_retries_plus_one_times() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stores/store-1/changes"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3) // max_retries = 2 → three attempts total
        .mount(&server)
        .await;

    let fetcher = fetcher(&server.uri(), Credentials::None);
    let err = fetcher.fetch("", 10).await.unwrap_err();
    assert!(err.is_transient(), "expected transient error, got {err}");

    let stats = fetcher.stats();
    assert_eq!(stats.total_requests, 1, "stats count invocations, not attempts");
    assert_eq!(stats.failed_requests, 1);
}

#[tokio::test]
async fn permanent_api_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stores/store-1/changes"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad token"))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fetcher(&server.uri(), Credentials::None);
    let err = fetcher.fetch("", 10).await.unwrap_err();
    match err {
        SyncError::Api { status, .. } => assert_eq!(status, 400),
        other => panic!("expected api error, got {other}"),
    }
}

#[tokio::test]
async fn malformed_records_are_skipped_and_the_page_survives() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stores/store-1/changes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [
                change_record("user:alice", "document:a", "WRITE"),
                {"operation": "WRITE"}, // no tuple_key
                change_record("user:bob", "document:b", "WRITE"),
            ],
            "continuation_token": "t1"
        })))
        .mount(&server)
        .await;

    let fetcher = fetcher(&server.uri(), Credentials::None);
    let page = fetcher.fetch("", 10).await.unwrap();

    assert_eq!(page.count, 2);
    assert_eq!(page.events[0].object_id, "a");
    assert_eq!(page.events[1].object_id, "b");
    assert_eq!(page.next_token, "t1");
}

#[tokio::test]
async fn bearer_token_is_sent_in_authorization_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stores/store-1/changes"))
        .and(header("authorization", "Bearer static-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"changes": [], "continuation_token": ""})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fetcher(
        &server.uri(),
        Credentials::ApiToken(SecretString::new("static-token".to_string())),
    );
    let page = fetcher.fetch("", 10).await.unwrap();
    assert!(page.is_empty());
    assert!(!page.has_more);
}

#[tokio::test]
async fn client_credentials_refresh_and_retry_once_on_401() {
    let server = MockServer::start().await;

    // Issuer endpoint: hand out a fresh token each time.
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "granted",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .expect(2) // initial acquisition + refresh after the 401
        .mount(&server)
        .await;

    // First changes request is rejected, second succeeds.
    Mock::given(method("GET"))
        .and(path("/stores/store-1/changes"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/stores/store-1/changes"))
        .and(header("authorization", "Bearer granted"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [change_record("user:alice", "document:a", "WRITE")],
            "continuation_token": ""
        })))
        .mount(&server)
        .await;

    let credentials = Credentials::ClientCredentials(ClientCredentials {
        issuer: server.uri(),
        audience: "https://fga.example.com".to_string(),
        client_id: "client".to_string(),
        client_secret: SecretString::new("secret".to_string()),
        scopes: vec!["read:changes".to_string()],
    });

    let fetcher = fetcher(&server.uri(), credentials);
    let page = fetcher.fetch("", 10).await.unwrap();
    assert_eq!(page.count, 1);
}

#[tokio::test]
async fn shutdown_cancels_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stores/store-1/changes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"changes": []})))
        .expect(0)
        .mount(&server)
        .await;

    let api = FgaApi::new(
        &server.uri(),
        "store-1",
        Credentials::None,
        Duration::from_secs(5),
        None,
    )
    .unwrap();
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let fetcher = ChangeFetcher::new(api, fast_options(), shutdown);

    let err = fetcher.fetch("", 10).await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
}

#[tokio::test]
async fn fetch_since_filters_older_events() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stores/store-1/changes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [
                {
                    "tuple_key": {"user": "user:old", "relation": "viewer", "object": "document:a"},
                    "operation": "WRITE",
                    "timestamp": "2024-01-01T00:00:00Z"
                },
                {
                    "tuple_key": {"user": "user:new", "relation": "viewer", "object": "document:a"},
                    "operation": "WRITE",
                    "timestamp": "2024-06-01T00:00:00Z"
                },
            ],
            "continuation_token": ""
        })))
        .mount(&server)
        .await;

    let fetcher = fetcher(&server.uri(), Credentials::None);
    let since = chrono::DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let result = fetcher.fetch_since(since, 0).await.unwrap();

    assert_eq!(result.count, 1);
    assert_eq!(result.events[0].subject_id, "new");
}

#[tokio::test]
async fn fetch_all_drains_pages_until_the_stream_is_dry() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/stores/store-1/changes"))
        .and(query_param("continuation_token", "t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [change_record("user:bob", "document:b", "WRITE")],
            "continuation_token": ""
        })))
        .mount(&server)
        .await;
    // First page: no continuation_token query parameter at all.
    Mock::given(method("GET"))
        .and(path("/stores/store-1/changes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [change_record("user:alice", "document:a", "WRITE")],
            "continuation_token": "t1"
        })))
        .mount(&server)
        .await;

    let fetcher = fetcher(&server.uri(), Credentials::None);
    let result = fetcher.fetch_all("", 0).await.unwrap();

    assert_eq!(result.count, 2);
    assert_eq!(result.events[0].object_id, "a");
    assert_eq!(result.events[1].object_id, "b");
    assert_eq!(result.next_token, "t1");
    assert!(!result.has_more);
}
