//! Liveness, readiness, and metrics-exposition endpoints.
//!
//! - `GET /livez`   — process is alive, no dependency checks
//! - `GET /healthz` — service detail payload, always 200 while running
//! - `GET /readyz`  — 200 once the sync loop runs, 503 while draining
//! - `GET /metrics` — Prometheus text exposition

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub details: HealthDetails,
}

#[derive(Debug, Serialize)]
pub struct HealthDetails {
    pub backend_type: &'static str,
    pub sink_mode: &'static str,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub service: &'static str,
}

pub async fn livez() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "up",
        service: "tuplesyncd",
        version: state.version,
        uptime_seconds: state.uptime_seconds(),
        details: HealthDetails {
            backend_type: state.backend_type,
            sink_mode: state.sink_mode,
            poll_interval_secs: state.poll_interval_secs,
        },
    };
    (StatusCode::OK, Json(response))
}

pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                service: "tuplesyncd",
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready",
                service: "tuplesyncd",
            }),
        )
    }
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = String::new();
    {
        let registry = match state.registry.lock() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = prometheus_client::encoding::text::encode(&mut body, &registry) {
            tracing::error!(error = %e, "failed to encode metrics");
            return (StatusCode::INTERNAL_SERVER_ERROR, "encoding failed").into_response();
        }
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::registry::Registry;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tokio::sync::watch;

    fn state(ready: bool) -> (AppState, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(ready);
        (
            AppState {
                started_at: Instant::now(),
                version: "0.1.0",
                ready: rx,
                registry: Arc::new(Mutex::new(Registry::default())),
                backend_type: "sqlite",
                sink_mode: "log",
                poll_interval_secs: 5,
            },
            tx,
        )
    }

    #[tokio::test]
    async fn readiness_tracks_the_loop_flag() {
        let (state, tx) = state(false);
        let response = readyz(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        tx.send(true).unwrap();
        let response = readyz(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_configuration_details() {
        let (state, _tx) = state(true);
        let response = healthz(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_encodes_the_registry() {
        let (state, _tx) = state(true);
        let response = metrics(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
