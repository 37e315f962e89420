//! Fail-closed checks on identity and time fields.
//!
//! Ingestion is expected to reject bad input before it reaches the core.
//! These checks exist so that anything slipping past it stops the call
//! instead of flowing into snapshots and assessments.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::{PipelineError, Result};

static PSEUDONYM_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]{7,127}$").expect("static pattern"));

static PHI_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        ("ssn", Regex::new(r"^\d{3}-?\d{2}-?\d{4}$").expect("static pattern")),
        ("phone", Regex::new(r"^\+?1?\d{10}$").expect("static pattern")),
        (
            "date",
            Regex::new(r"(19|20)\d{2}-(0[1-9]|1[0-2])-(0[1-9]|[12]\d|3[01])")
                .expect("static pattern"),
        ),
    ]
});

/// Reject identifiers that are too short, use characters outside the
/// pseudonym alphabet, or resemble a direct identifier.
pub fn check_pseudonymized_id(field: &'static str, value: &str) -> Result<()> {
    if value.len() < 8 {
        return Err(PipelineError::InvalidIdentifier {
            field,
            reason: format!("must be at least 8 characters, got {}", value.len()),
        });
    }
    if !PSEUDONYM_SHAPE.is_match(value) {
        return Err(PipelineError::InvalidIdentifier {
            field,
            reason: "contains characters outside [A-Za-z0-9_-]".to_string(),
        });
    }
    for (label, pattern) in PHI_PATTERNS.iter() {
        if pattern.is_match(value) {
            return Err(PipelineError::InvalidIdentifier {
                field,
                reason: format!("looks like a {label}"),
            });
        }
    }
    Ok(())
}

/// Parse an RFC 3339 timestamp. A value without an explicit offset is rejected.
pub fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| PipelineError::InvalidTimestamp {
            field,
            reason: format!("{value:?} is not an offset-qualified RFC 3339 timestamp ({err})"),
        })
}

pub fn parse_optional_timestamp(
    field: &'static str,
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => parse_timestamp(field, raw).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_opaque_tokens() {
        assert!(check_pseudonymized_id("member_id", "M00000001").is_ok());
        assert!(check_pseudonymized_id("bundle_id", "bundle_ab12-cd34").is_ok());
    }

    #[test]
    fn rejects_short_and_malformed_tokens() {
        assert!(matches!(
            check_pseudonymized_id("member_id", "M0001"),
            Err(PipelineError::InvalidIdentifier { field: "member_id", .. })
        ));
        assert!(check_pseudonymized_id("member_id", "avery@example.com").is_err());
        assert!(check_pseudonymized_id("member_id", "member 0001").is_err());
    }

    #[test]
    fn rejects_phi_shaped_tokens() {
        assert!(check_pseudonymized_id("member_id", "123-45-6789").is_err());
        assert!(check_pseudonymized_id("member_id", "5551234567").is_err());
        assert!(check_pseudonymized_id("member_id", "dob-1984-02-12").is_err());
    }

    #[test]
    fn timestamps_need_an_offset() {
        let parsed = parse_timestamp("event_timestamp", "2026-10-01T08:00:00+02:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-10-01T06:00:00+00:00");
        assert!(matches!(
            parse_timestamp("event_timestamp", "2026-10-01T08:00:00"),
            Err(PipelineError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn blank_optional_timestamps_are_absent() {
        assert_eq!(parse_optional_timestamp("ship_by_date", Some("  ")).unwrap(), None);
        assert_eq!(parse_optional_timestamp("ship_by_date", None).unwrap(), None);
    }
}
