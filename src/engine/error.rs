use std::time::Duration;

use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, Ms, rfc3339};

/// One rejected input field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Why a requested start time cannot be reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    /// An occupying booking overlaps the requested interval.
    Taken(Ulid),
    /// No availability rule produces this start time (stale, past, or forged).
    NotOffered,
}

impl std::fmt::Display for Unavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unavailable::Taken(id) => write!(f, "overlaps booking {id}"),
            Unavailable::NotOffered => f.write_str("not an offered slot"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {}", join_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("slot {} unavailable on service {service_type_id}: {reason}", timestamp(.requested_at))]
    SlotUnavailable {
        service_type_id: Ulid,
        requested_at: Ms,
        reason: Unavailable,
    },

    #[error("booking {booking_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        booking_id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("timed out after {0:?} waiting for the service lock")]
    Timeout(Duration),

    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        EngineError::Validation(vec![FieldError::new(field, message)])
    }

    /// Only a timed-out reservation is worth retrying with the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }
}

fn timestamp(ms: &Ms) -> String {
    rfc3339(*ms)
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_lists_every_field() {
        let err = EngineError::Validation(vec![
            FieldError::new("email", "missing '@'"),
            FieldError::new("phone", "too few digits"),
        ]);
        assert_eq!(
            err.to_string(),
            "validation failed: email: missing '@'; phone: too few digits"
        );
    }

    #[test]
    fn only_timeout_is_retryable() {
        assert!(EngineError::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(!EngineError::NotFound(Ulid::new()).is_retryable());
        assert!(!EngineError::SlotUnavailable {
            service_type_id: Ulid::new(),
            requested_at: 0,
            reason: Unavailable::NotOffered,
        }
        .is_retryable());
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = EngineError::InvalidTransition {
            booking_id: Ulid::nil(),
            from: BookingStatus::Cancelled,
            to: BookingStatus::Completed,
        };
        assert!(err.to_string().ends_with("cannot move from cancelled to completed"));
    }
}
