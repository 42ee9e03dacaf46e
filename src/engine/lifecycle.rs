//! Booking status transitions.
//!
//! ```text
//! pending   -> confirmed | cancelled | no_show
//! confirmed -> completed | cancelled | no_show
//! ```
//!
//! Every other pair, including a status to itself, is rejected and leaves the
//! booking untouched.

use crate::model::{Booking, BookingStatus, Origin};

use super::{EngineError, FieldError};

pub fn allowed_transitions(from: BookingStatus) -> &'static [BookingStatus] {
    use BookingStatus::*;
    match from {
        Pending => &[Confirmed, Cancelled, NoShow],
        Confirmed => &[Completed, Cancelled, NoShow],
        Completed | Cancelled | NoShow => &[],
    }
}

pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

pub(crate) fn check_transition(booking: &Booking, to: BookingStatus) -> Result<(), EngineError> {
    if can_transition(booking.status, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            booking_id: booking.id,
            from: booking.status,
            to,
        })
    }
}

/// Status a new booking starts in. Public intake always starts `pending`;
/// staff may also start at `confirmed`.
pub(crate) fn initial_status(origin: Origin, requested: BookingStatus) -> Result<BookingStatus, FieldError> {
    match (origin, requested) {
        (_, BookingStatus::Pending) => Ok(BookingStatus::Pending),
        (Origin::Staff, BookingStatus::Confirmed) => Ok(BookingStatus::Confirmed),
        (Origin::PublicIntake, BookingStatus::Confirmed) => Err(FieldError::new(
            "status",
            "public bookings start as pending",
        )),
        (_, other) => Err(FieldError::new(
            "status",
            format!("a booking cannot start as {other}"),
        )),
    }
}
