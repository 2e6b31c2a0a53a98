//! Project a handful of changes into an in-memory SQLite sink and print the
//! resulting statistics.
//!
//! ```sh
//! cargo run -p tuplesync-store --example sqlite_demo
//! ```

use chrono::Utc;

use tuplesync_core::{ChangeEvent, ChangeKind};
use tuplesync_store::{ChangeSink, SinkMode, SqliteSink};

fn event(operation: &str, subject: &str, relation: &str, object: &str) -> ChangeEvent {
    let (subject_type, subject_id) = tuplesync_core::identity::split_subject(subject);
    let (object_type, object_id) = tuplesync_core::identity::split_object(object);
    ChangeEvent {
        object_type,
        object_id,
        relation: relation.to_string(),
        subject_type,
        subject_id,
        operation: operation.to_string(),
        kind: ChangeKind::from_operation(operation),
        timestamp: Utc::now(),
        timestamp_inferred: false,
        condition: None,
        raw: "{}".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sink = SqliteSink::connect(":memory:", SinkMode::State, 100).await?;

    sink.apply_state(
        &[
            event("WRITE", "user:alice", "viewer", "document:readme"),
            event("WRITE", "user:bob", "editor", "document:readme"),
            event("WRITE", "group:engineering#member", "viewer", "document:design"),
            event("DELETE", "user:alice", "viewer", "document:readme"),
        ],
        Some("demo-token-1"),
    )
    .await?;

    let stats = sink.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("cursor: {}", sink.read_cursor().await?);

    sink.close().await?;
    Ok(())
}
