//! Defensive parsing of source wire records into [`ChangeEvent`]s.
//!
//! The wire shape has drifted across source versions, so every field access
//! has an explicit fallback. A record missing its `tuple_key` (or not being
//! an object at all) is malformed and skipped; absent scalar fields degrade
//! to empty strings and are caught by advisory validation downstream.

use chrono::{DateTime, Utc};
use serde_json::Value;

use tuplesync_core::identity::{split_object, split_subject};
use tuplesync_core::{ChangeEvent, ChangeKind, SyncError, SyncResult};

/// Parse one wire record.
///
/// Errors mean the record is structurally unusable; the caller skips it with
/// a warning and the surrounding page still succeeds.
pub fn parse_change(record: &Value) -> SyncResult<ChangeEvent> {
    let obj = record
        .as_object()
        .ok_or_else(|| SyncError::parse("change record is not an object"))?;

    let tuple_key = obj
        .get("tuple_key")
        .and_then(Value::as_object)
        .ok_or_else(|| SyncError::parse("change record has no tuple_key"))?;

    let operation = string_field(obj.get("operation"));
    let (timestamp, timestamp_inferred) = parse_timestamp(obj.get("timestamp"));

    let user = string_field(tuple_key.get("user"));
    let relation = string_field(tuple_key.get("relation"));
    let object = string_field(tuple_key.get("object"));

    let condition = tuple_key
        .get("condition")
        .filter(|c| c.is_object())
        .map(|c| c.to_string());

    let raw = record.to_string();

    let (subject_type, subject_id) = split_subject(&user);
    let (object_type, object_id) = split_object(&object);
    let kind = ChangeKind::from_operation(&operation);

    Ok(ChangeEvent {
        object_type,
        object_id,
        relation,
        subject_type,
        subject_id,
        operation,
        kind,
        timestamp,
        timestamp_inferred,
        condition,
        raw,
    })
}

/// Scalar extraction: strings pass through, other non-null scalars are
/// stringified, null/absent become empty.
fn string_field(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Timestamp extraction; a missing or unparseable value substitutes "now"
/// and flags the event for validation.
fn parse_timestamp(value: Option<&Value>) -> (DateTime<Utc>, bool) {
    if let Some(Value::String(s)) = value {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
            return (parsed.with_timezone(&Utc), false);
        }
    }
    (Utc::now(), true)
}
