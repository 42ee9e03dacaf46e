use chrono::{DateTime, Datelike, LocalResult, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::*;

use super::conflict::find_conflict;

// ── Slot generation ───────────────────────────────────────────────

/// 0 = Sunday … 6 = Saturday, the numbering availability rules use.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Resolve a workspace-local wall-clock time to an absolute instant.
///
/// A time inside a DST gap does not exist and yields `None`; a time repeated by
/// a DST fold resolves to its earlier occurrence.
pub fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<Ms> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.timestamp_millis()),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.timestamp_millis()),
        LocalResult::None => None,
    }
}

/// Like `resolve_local`, but a time inside a DST gap moves forward to the first
/// instant after the gap.
pub fn resolve_local_or_next(tz: Tz, local: NaiveDateTime) -> Option<Ms> {
    (0..=MAX_GAP_MINUTES).find_map(|m| resolve_local(tz, local + TimeDelta::minutes(m)))
}

/// Upper bound on the forward search out of a DST gap.
const MAX_GAP_MINUTES: i64 = 24 * 60;

/// The calendar date an instant falls on in `tz`.
pub fn local_date(at: Ms, tz: Tz) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(at).map(|dt| dt.with_timezone(&tz).date_naive())
}

/// Candidate slots for one service on one local date.
///
/// Each rule whose day matches `date` is walked from its start in back-to-back
/// steps of `duration_minutes`; a step is emitted only if the whole slot ends at
/// or before the rule's end, compared both on the wall clock and as absolute
/// instants, so a slot straddling a spring-forward gap cannot overrun the rule. The union over all rules comes back sorted by start
/// with duplicates removed. Should two rules overlap, a candidate starting before
/// the previous kept candidate ends is dropped, so the result never overlaps
/// itself. Candidates starting before `now` are excluded last, which keeps the
/// grid for a given rule set stable over the day.
pub fn generate_slots(
    rules: &[AvailabilityRule],
    date: NaiveDate,
    tz: Tz,
    duration_minutes: u32,
    now: Ms,
) -> Vec<Span> {
    if duration_minutes == 0 {
        return Vec::new();
    }
    let step = TimeDelta::minutes(i64::from(duration_minutes));
    let duration_ms = step.num_milliseconds();
    let day = day_of_week(date);

    let mut slots = Vec::new();
    for rule in rules.iter().filter(|r| r.day_of_week == day) {
        let window_end = date.and_time(rule.end_time);
        let Some(end_ms) = resolve_local_or_next(tz, window_end) else {
            continue;
        };
        let mut local = date.and_time(rule.start_time);
        while local + step <= window_end {
            if let Some(start) = resolve_local(tz, local)
                && start + duration_ms <= end_ms
            {
                slots.push(Span::new(start, start + duration_ms));
            }
            local += step;
        }
    }

    slots.sort_by_key(|s| s.start);
    slots.dedup_by_key(|s| s.start);

    let mut frontier = Ms::MIN;
    slots.retain(|s| {
        if s.start >= frontier {
            frontier = s.end;
            true
        } else {
            false
        }
    });

    slots.retain(|s| s.start >= now);
    slots
}

/// Whether `start` is one of today's candidates for this service.
pub fn is_offered(state: &ServiceState, tz: Tz, start: Ms, now: Ms) -> bool {
    let Some(date) = local_date(start, tz) else {
        return false;
    };
    generate_slots(
        state.rules_on(day_of_week(date)),
        date,
        tz,
        state.service.duration_minutes,
        now,
    )
    .iter()
    .any(|slot| slot.start == start)
}

/// Drop candidates that overlap an occupying booking.
pub fn open_slots(state: &ServiceState, candidates: Vec<Span>) -> Vec<Span> {
    candidates
        .into_iter()
        .filter(|slot| find_conflict(state, slot).is_none())
        .collect()
}
