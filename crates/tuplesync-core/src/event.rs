//! Typed representation of a relationship-tuple change event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a change, derived from the source operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A tuple was written (added or re-asserted).
    TupleWrite,
    /// A tuple was deleted.
    TupleDelete,
    /// Operation not recognized; recorded in log mode, skipped in state mode.
    TupleChange,
}

impl ChangeKind {
    /// Derive the kind from a source operation string, case-insensitively.
    #[must_use]
    pub fn from_operation(operation: &str) -> Self {
        match operation.to_uppercase().as_str() {
            "WRITE" | "TUPLE_TO_USERSET_WRITE" => ChangeKind::TupleWrite,
            "DELETE" | "TUPLE_TO_USERSET_DELETE" => ChangeKind::TupleDelete,
            _ => ChangeKind::TupleChange,
        }
    }

    /// Stable string form used in persisted rows and metric labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::TupleWrite => "tuple_write",
            ChangeKind::TupleDelete => "tuple_delete",
            ChangeKind::TupleChange => "tuple_change",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tuple_write" => Ok(ChangeKind::TupleWrite),
            "tuple_delete" => Ok(ChangeKind::TupleDelete),
            "tuple_change" => Ok(ChangeKind::TupleChange),
            other => Err(format!("unknown change kind: {other}")),
        }
    }
}

/// A single change to one relationship tuple, as emitted by the source.
///
/// Identity fields are already split into `(type, id)` pairs. The original
/// wire record is preserved verbatim in `raw` for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub object_type: String,
    pub object_id: String,
    pub relation: String,
    pub subject_type: String,
    pub subject_id: String,
    /// Verbatim operation string from the source (e.g. `WRITE`, `DELETE`).
    pub operation: String,
    /// Kind derived from `operation`.
    pub kind: ChangeKind,
    /// Event timestamp (UTC). When the source omits it, the parse substitutes
    /// the current instant and sets `timestamp_inferred`.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub timestamp_inferred: bool,
    /// Serialized condition payload, opaque to the pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// The unparsed source record, canonical JSON.
    pub raw: String,
}

impl ChangeEvent {
    /// Re-join the subject into the source's `type:id` form.
    #[must_use]
    pub fn subject(&self) -> String {
        if self.subject_type.is_empty() {
            self.subject_id.clone()
        } else {
            format!("{}:{}", self.subject_type, self.subject_id)
        }
    }

    /// Re-join the object into the source's `type:id` form.
    #[must_use]
    pub fn object(&self) -> String {
        if self.object_type.is_empty() {
            self.object_id.clone()
        } else {
            format!("{}:{}", self.object_type, self.object_id)
        }
    }

    /// Advisory validation: names of fields that are empty or inferred.
    ///
    /// An empty return means the event is fully formed. Validation never
    /// gates the pipeline; findings are reported and the event forwarded.
    #[must_use]
    pub fn validation_findings(&self) -> Vec<&'static str> {
        let mut findings = Vec::new();
        if self.object_type.is_empty() {
            findings.push("object_type");
        }
        if self.object_id.is_empty() {
            findings.push("object_id");
        }
        if self.relation.is_empty() {
            findings.push("relation");
        }
        if self.subject_type.is_empty() {
            findings.push("subject_type");
        }
        if self.subject_id.is_empty() {
            findings.push("subject_id");
        }
        if self.timestamp_inferred {
            findings.push("timestamp");
        }
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> ChangeEvent {
        ChangeEvent {
            object_type: "document".to_string(),
            object_id: "readme".to_string(),
            relation: "viewer".to_string(),
            subject_type: "user".to_string(),
            subject_id: "alice".to_string(),
            operation: "WRITE".to_string(),
            kind: ChangeKind::TupleWrite,
            timestamp: Utc::now(),
            timestamp_inferred: false,
            condition: None,
            raw: "{}".to_string(),
        }
    }

    #[test]
    fn kind_derivation_is_case_insensitive() {
        assert_eq!(ChangeKind::from_operation("write"), ChangeKind::TupleWrite);
        assert_eq!(ChangeKind::from_operation("WRITE"), ChangeKind::TupleWrite);
        assert_eq!(
            ChangeKind::from_operation("TUPLE_TO_USERSET_WRITE"),
            ChangeKind::TupleWrite
        );
        assert_eq!(
            ChangeKind::from_operation("delete"),
            ChangeKind::TupleDelete
        );
        assert_eq!(
            ChangeKind::from_operation("TUPLE_TO_USERSET_DELETE"),
            ChangeKind::TupleDelete
        );
    }

    #[test]
    fn unknown_operations_become_tuple_change() {
        assert_eq!(ChangeKind::from_operation(""), ChangeKind::TupleChange);
        assert_eq!(
            ChangeKind::from_operation("NOOP"),
            ChangeKind::TupleChange
        );
    }

    #[test]
    fn kind_round_trips_through_string() {
        for kind in [
            ChangeKind::TupleWrite,
            ChangeKind::TupleDelete,
            ChangeKind::TupleChange,
        ] {
            let parsed: ChangeKind = kind.as_str().parse().unwrap();
            assert_eq!(kind, parsed);
        }
    }

    #[test]
    fn rejoins_qualified_forms() {
        let e = event();
        assert_eq!(e.subject(), "user:alice");
        assert_eq!(e.object(), "document:readme");
    }

    #[test]
    fn well_formed_event_has_no_findings() {
        assert!(event().validation_findings().is_empty());
    }

    #[test]
    fn validation_reports_empty_and_inferred_fields() {
        let mut e = event();
        e.subject_id = String::new();
        e.timestamp_inferred = true;
        let findings = e.validation_findings();
        assert!(findings.contains(&"subject_id"));
        assert!(findings.contains(&"timestamp"));
        assert_eq!(findings.len(), 2);
    }
}
