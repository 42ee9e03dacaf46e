use chrono::Utc;

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::{EngineError, FieldError, Unavailable};

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

pub(crate) fn validate_timestamp(field: &'static str, at: Ms) -> Result<(), FieldError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&at) {
        return Err(FieldError::new(field, "timestamp out of range"));
    }
    Ok(())
}

/// The first booking that still holds time inside `span`.
///
/// Cancelled, no-show and completed bookings stay in the state for history
/// but never block a new reservation.
pub fn find_conflict<'a>(state: &'a ServiceState, span: &Span) -> Option<&'a Booking> {
    state
        .overlapping(span)
        .find(|booking| booking.status.occupies())
}

pub(crate) fn check_no_conflict(state: &ServiceState, span: &Span) -> Result<(), EngineError> {
    match find_conflict(state, span) {
        Some(existing) => Err(EngineError::SlotUnavailable {
            service_type_id: state.service.id,
            requested_at: span.start,
            reason: Unavailable::Taken(existing.id),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const M: Ms = MINUTE_MS;

    fn state() -> ServiceState {
        ServiceState::new(ServiceType {
            id: Ulid::new(),
            workspace_id: Ulid::new(),
            name: "Massage".into(),
            description: None,
            duration_minutes: 60,
            location: None,
            active: true,
        })
    }

    fn add(st: &mut ServiceState, start_min: Ms, minutes: u32, status: BookingStatus) -> Ulid {
        let id = Ulid::new();
        st.insert_booking(Booking {
            id,
            workspace_id: st.service.workspace_id,
            service_type_id: st.service.id,
            contact_id: Ulid::new(),
            scheduled_at: start_min * M,
            duration_minutes: minutes,
            status,
            notes: None,
            created_at: 0,
            updated_at: 0,
        });
        id
    }

    #[test]
    fn pending_and_confirmed_block() {
        for status in [BookingStatus::Pending, BookingStatus::Confirmed] {
            let mut st = state();
            let id = add(&mut st, 60, 60, status);
            let err = check_no_conflict(&st, &Span::new(90 * M, 150 * M)).unwrap_err();
            match err {
                EngineError::SlotUnavailable { reason, requested_at, .. } => {
                    assert_eq!(reason, Unavailable::Taken(id));
                    assert_eq!(requested_at, 90 * M);
                }
                other => panic!("expected SlotUnavailable, got {other:?}"),
            }
        }
    }

    #[test]
    fn terminal_bookings_do_not_block() {
        let mut st = state();
        add(&mut st, 60, 60, BookingStatus::Cancelled);
        add(&mut st, 60, 60, BookingStatus::NoShow);
        add(&mut st, 60, 60, BookingStatus::Completed);
        assert!(check_no_conflict(&st, &Span::new(60 * M, 120 * M)).is_ok());
    }

    #[test]
    fn touching_intervals_do_not_conflict() {
        let mut st = state();
        add(&mut st, 60, 60, BookingStatus::Confirmed);
        assert!(check_no_conflict(&st, &Span::new(0, 60 * M)).is_ok());
        assert!(check_no_conflict(&st, &Span::new(120 * M, 180 * M)).is_ok());
        assert!(check_no_conflict(&st, &Span::new(119 * M, 180 * M)).is_err());
    }

    #[test]
    fn occupying_booking_found_behind_freed_one() {
        let mut st = state();
        add(&mut st, 60, 60, BookingStatus::Cancelled);
        let live = add(&mut st, 60, 60, BookingStatus::Pending);
        let hit = find_conflict(&st, &Span::new(60 * M, 120 * M)).map(|b| b.id);
        assert_eq!(hit, Some(live));
    }

    #[test]
    fn timestamp_bounds() {
        assert!(validate_timestamp("scheduled_at", MIN_VALID_TIMESTAMP_MS).is_ok());
        assert!(validate_timestamp("scheduled_at", MIN_VALID_TIMESTAMP_MS - 1).is_err());
        assert!(validate_timestamp("scheduled_at", MAX_VALID_TIMESTAMP_MS).is_err());
    }
}
