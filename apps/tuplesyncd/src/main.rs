//! tuplesyncd continuously materializes relationship-tuple change events
//! from a source store into a relational log, a current-state projection, or
//! a replica store.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error or forced exit after
//! a second shutdown signal, 2 fatal runtime error after draining.

mod config;
mod health;
mod logging;
mod state;

use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tuplesync_fga::{ChangeFetcher, FgaApi};
use tuplesync_store::{create_sink, ChangeSink};
use tuplesync_sync::{SyncMetrics, SyncService};

use config::Config;
use state::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(1);
        }
    };

    logging::init(&config.log_level, config.log_format);

    info!(
        version = VERSION,
        source_endpoint = %config.source_endpoint,
        source_store = %config.source_store_id,
        backend_type = config.backend_type.as_str(),
        sink_mode = config.sink_mode.as_str(),
        poll_interval_secs = config.poll_interval.as_secs(),
        server_port = config.server_port,
        metrics_enabled = config.metrics_enabled,
        "starting tuplesync service"
    );

    let metrics = Arc::new(SyncMetrics::new());
    let mut registry = Registry::default();
    metrics.register(&mut registry);
    metrics
        .service_start_timestamp
        .set(chrono::Utc::now().timestamp() as f64);

    let shutdown = CancellationToken::new();

    // Source client.
    let api = match FgaApi::new(
        &config.source_endpoint,
        &config.source_store_id,
        config.credentials(),
        config.request_timeout,
        None,
    ) {
        Ok(api) => api,
        Err(e) => {
            error!(error = %e, "failed to build the source client");
            return ExitCode::from(1);
        }
    };
    let fetcher = ChangeFetcher::new(api, config.fetch_options(), shutdown.clone());

    // Sink.
    let sink: Arc<dyn ChangeSink> = match create_sink(
        config.backend_type,
        &config.backend_dsn,
        config.sink_mode,
        config.sink_batch_size,
    )
    .await
    {
        Ok(sink) => sink,
        Err(e) => {
            error!(error = %e, "failed to initialize the sink");
            return ExitCode::from(1);
        }
    };

    // Sync loop; readiness is pushed to the admin surface from here.
    let (service, ready_rx) = SyncService::new(
        fetcher,
        sink.clone(),
        config.sync_options(),
        metrics.clone(),
        shutdown.clone(),
    );

    let app_state = AppState {
        started_at: Instant::now(),
        version: VERSION,
        ready: ready_rx,
        registry: Arc::new(Mutex::new(registry)),
        backend_type: config.backend_type.as_str(),
        sink_mode: config.sink_mode.as_str(),
        poll_interval_secs: config.poll_interval.as_secs(),
    };

    let server = match spawn_admin_server(&config, app_state, shutdown.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to start the admin server");
            return ExitCode::from(1);
        }
    };

    spawn_uptime_ticker(metrics.clone(), shutdown.clone());
    spawn_storage_probe(sink.clone(), metrics.clone(), shutdown.clone());
    spawn_signal_handler(shutdown.clone());

    info!("tuplesync service started");
    let sync_result = service.run().await;

    // The loop has drained (readiness already flipped); now stop the admin
    // surface and the background tasks.
    shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(10), server).await.is_err() {
        warn!("admin server did not stop within 10s");
    }

    match sync_result {
        Ok(()) => {
            info!("tuplesync service stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, code = e.code(), "sync loop terminated with a fatal error");
            ExitCode::from(2)
        }
    }
}

async fn spawn_admin_server(
    config: &Config,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let mut router = Router::new()
        .route("/livez", get(health::livez))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz));
    if config.metrics_enabled {
        router = router.route("/metrics", get(health::metrics));
    }
    let app = router.with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin server listening");

    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            error!(error = %e, "admin server error");
        }
    }))
}

/// Once per second, count uptime.
fn spawn_uptime_ticker(metrics: Arc<SyncMetrics>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                _ = interval.tick() => metrics.uptime_seconds.inc(),
            };
        }
    });
}

/// Every 30 seconds, sample sink statistics and reflect connection health.
fn spawn_storage_probe(
    sink: Arc<dyn ChangeSink>,
    metrics: Arc<SyncMetrics>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        // The immediate first tick would probe before the loop has started.
        interval.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                _ = interval.tick() => {
                    let healthy = match sink.stats().await {
                        Ok(stats) => stats.connection_healthy,
                        Err(e) => {
                            debug!(error = %e, "storage probe failed");
                            false
                        }
                    };
                    metrics
                        .storage_connection_status
                        .set(i64::from(healthy));
                }
            };
        }
    });
}

/// First SIGINT/SIGTERM starts the drain; a second signal, or a 30 second
/// deadline, forces an immediate exit with code 1.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        info!(signal, "shutdown signal received, draining");
        shutdown.cancel();

        tokio::select! {
            second = wait_for_signal() => {
                error!(signal = second, "second shutdown signal, forcing immediate exit");
                std::process::exit(1);
            }
            () = tokio::time::sleep(Duration::from_secs(30)) => {
                error!("shutdown deadline exceeded, forcing exit");
                std::process::exit(1);
            }
        }
    });
}

async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
                unreachable!()
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
