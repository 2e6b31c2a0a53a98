//! Tracing subscriber setup.
//!
//! Text output for local development, JSON for log aggregation. The filter
//! honors `RUST_LOG` when set, otherwise the configured level.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LogFormat;

pub fn init(level: &str, format: LogFormat) {
    let filter = match EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level)) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("FATAL: invalid log filter {level:?}: {e}");
            std::process::exit(1);
        }
    };

    let fmt_layer: Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync> = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .flatten_event(true)
            .boxed(),
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();
}
