//! Qualified identity splitting for tuple subjects and objects.
//!
//! The source encodes identities as `"type:id"` strings, with subject-set
//! references taking the form `"type:id#relation"`. Splitting is total: every
//! input yields a `(type, id)` pair, falling back to a caller-supplied default
//! type when no usable prefix is present.

/// Default type assigned to subject strings without a type prefix.
pub const DEFAULT_SUBJECT_TYPE: &str = "subject";

/// Default type assigned to object strings without a type prefix.
pub const DEFAULT_OBJECT_TYPE: &str = "object";

/// Split a qualified identity string into `(type, id)`.
///
/// Rules, tried in order:
///
/// 1. Empty input yields `(default_type, "")`.
/// 2. Inputs containing `#` (a subject-set qualifier) split at the *first*
///    `:`; the remainder keeps the `#relation` suffix. A missing or empty
///    prefix falls back to `(default_type, input)`.
/// 3. Inputs containing `:` split at the first `:` when the prefix is
///    non-empty; the id may itself contain further colons.
/// 4. Anything else is a bare id: `(default_type, input)`.
#[must_use]
pub fn split_qualified(raw: &str, default_type: &str) -> (String, String) {
    if raw.is_empty() {
        return (default_type.to_string(), String::new());
    }

    if raw.contains('#') {
        if let Some((prefix, rest)) = raw.split_once(':') {
            if !prefix.is_empty() {
                return (prefix.to_string(), rest.to_string());
            }
        }
        return (default_type.to_string(), raw.to_string());
    }

    if let Some((prefix, rest)) = raw.split_once(':') {
        if !prefix.is_empty() {
            return (prefix.to_string(), rest.to_string());
        }
    }

    (default_type.to_string(), raw.to_string())
}

/// Split a subject string, defaulting the type to [`DEFAULT_SUBJECT_TYPE`].
#[must_use]
pub fn split_subject(raw: &str) -> (String, String) {
    split_qualified(raw, DEFAULT_SUBJECT_TYPE)
}

/// Split an object string, defaulting the type to [`DEFAULT_OBJECT_TYPE`].
#[must_use]
pub fn split_object(raw: &str) -> (String, String) {
    split_qualified(raw, DEFAULT_OBJECT_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_standard_form() {
        assert_eq!(
            split_subject("user:alice"),
            ("user".to_string(), "alice".to_string())
        );
        assert_eq!(
            split_object("document:readme"),
            ("document".to_string(), "readme".to_string())
        );
    }

    #[test]
    fn splits_at_first_colon_only() {
        assert_eq!(
            split_subject("user:tenant:alice"),
            ("user".to_string(), "tenant:alice".to_string())
        );
    }

    #[test]
    fn subject_set_keeps_relation_suffix() {
        assert_eq!(
            split_subject("group:engineering#member"),
            ("group".to_string(), "engineering#member".to_string())
        );
    }

    #[test]
    fn subject_set_without_type_falls_back() {
        assert_eq!(
            split_subject("engineering#member"),
            ("subject".to_string(), "engineering#member".to_string())
        );
    }

    #[test]
    fn bare_id_uses_default_type() {
        assert_eq!(
            split_subject("alice"),
            ("subject".to_string(), "alice".to_string())
        );
        assert_eq!(
            split_object("readme"),
            ("object".to_string(), "readme".to_string())
        );
    }

    #[test]
    fn empty_input_yields_empty_id() {
        assert_eq!(split_subject(""), ("subject".to_string(), String::new()));
        assert_eq!(split_object(""), ("object".to_string(), String::new()));
    }

    #[test]
    fn leading_colon_is_not_a_type() {
        assert_eq!(
            split_subject(":alice"),
            ("subject".to_string(), ":alice".to_string())
        );
    }

    #[test]
    fn never_yields_empty_type() {
        for input in ["", ":", "::", "a", "a:b", ":b", "a#b", ":a#b", "#", "a:b#c:d"] {
            let (ty, _) = split_qualified(input, "fallback");
            assert!(!ty.is_empty(), "empty type for input {input:?}");
        }
    }
}
