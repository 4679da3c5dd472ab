//! Journey error taxonomy.
//!
//! Failures inside journey code come in two kinds: *domain errors* (expected
//! and structured, reported as `error` telemetry with their fields) and
//! *failures* (everything else, reported as `exception` telemetry with
//! location and backtrace). Once a transaction scope has reported a failure it
//! converts it into the `Handled` marker so outer scopes emit nothing further.

use std::panic::Location;

use serde_json::{Map, Value};
use thiserror::Error;

/// Error produced by journey code and routed through transaction scopes.
#[derive(Error, Debug)]
pub enum JourneyError {
    /// Expected, structured failure (e.g. an unexpected HTTP status).
    /// Reported as an `error` message carrying `fields`.
    #[error("{message}")]
    Error {
        message: String,
        fields: Map<String, Value>,
    },

    /// Anything that escaped journey code unexpectedly.
    /// Reported as an `exception` message with location and backtrace.
    #[error("{message}")]
    Failure {
        message: String,
        ex_type: String,
        location: String,
        stacktrace: String,
    },

    /// The failure was already reported by an inner transaction scope.
    /// Outer scopes swallow this without emitting anything.
    #[error("failure already reported by an inner transaction")]
    Handled,
}

impl JourneyError {
    /// A domain error with no structured fields.
    pub fn error(message: impl Into<String>) -> Self {
        JourneyError::Error {
            message: message.into(),
            fields: Map::new(),
        }
    }

    /// Attach a structured field to a domain error. No-op on other variants.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let JourneyError::Error { fields, .. } = &mut self {
            fields.insert(key.to_string(), value.into());
        }
        self
    }

    /// An unexpected failure, stamped with the caller's source location.
    #[track_caller]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::failure_as(message, "failure")
    }

    /// An unexpected failure with an explicit type tag.
    #[track_caller]
    pub fn failure_as(message: impl Into<String>, ex_type: impl Into<String>) -> Self {
        let loc = Location::caller();
        JourneyError::Failure {
            message: message.into(),
            ex_type: ex_type.into(),
            location: format!("{}:{}", loc.file(), loc.line()),
            stacktrace: std::backtrace::Backtrace::capture().to_string(),
        }
    }

    pub fn is_handled(&self) -> bool {
        matches!(self, JourneyError::Handled)
    }
}

impl From<reqwest::Error> for JourneyError {
    #[track_caller]
    fn from(e: reqwest::Error) -> Self {
        JourneyError::failure_as(e.to_string(), "reqwest::Error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_error_carries_fields() {
        let err = JourneyError::error("bad status")
            .with_field("status_code", 500)
            .with_field("body", "oops");

        match err {
            JourneyError::Error { message, fields } => {
                assert_eq!(message, "bad status");
                assert_eq!(fields["status_code"], 500);
                assert_eq!(fields["body"], "oops");
            }
            other => panic!("expected domain error, got {:?}", other),
        }
    }

    #[test]
    fn failure_records_location() {
        let err = JourneyError::failure("boom");
        match err {
            JourneyError::Failure { location, .. } => {
                assert!(location.contains("errors.rs"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn with_field_ignores_non_domain_variants() {
        let err = JourneyError::failure("boom").with_field("k", 1);
        assert!(matches!(err, JourneyError::Failure { .. }));
    }
}
