//! Page through a store's change stream and print each event.
//!
//! ```sh
//! OPENFGA_ENDPOINT=http://localhost:8080 \
//! OPENFGA_STORE_ID=01J0EXAMPLE \
//! OPENFGA_TOKEN=dev-token \
//!     cargo run -p tuplesync-fga --example changes_demo
//! ```

use std::time::Duration;

use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use tuplesync_core::ChangeSource;
use tuplesync_fga::{ChangeFetcher, Credentials, FetchOptions, FgaApi};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = std::env::var("OPENFGA_ENDPOINT")?;
    let store_id = std::env::var("OPENFGA_STORE_ID")?;
    let credentials = match std::env::var("OPENFGA_TOKEN") {
        Ok(token) if !token.is_empty() => Credentials::ApiToken(SecretString::new(token)),
        _ => Credentials::None,
    };

    let api = FgaApi::new(
        &endpoint,
        &store_id,
        credentials,
        Duration::from_secs(30),
        None,
    )?;
    let fetcher = ChangeFetcher::new(api, FetchOptions::default(), CancellationToken::new());

    let mut token = String::new();
    loop {
        let page = fetcher.fetch(&token, 50).await?;
        for event in &page.events {
            println!(
                "{} {} {} {} -> {}",
                event.timestamp.to_rfc3339(),
                event.kind,
                event.subject(),
                event.relation,
                event.object(),
            );
        }
        if !page.has_more {
            break;
        }
        token = page.next_token;
    }

    let stats = fetcher.stats();
    eprintln!(
        "requests: {} ok / {} failed, events: {}, latency: {:.1}ms",
        stats.success_requests,
        stats.failed_requests,
        stats.total_events,
        stats.ewma_latency_ms,
    );
    Ok(())
}
