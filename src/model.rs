use chrono::{DateTime, NaiveTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_DURATION_MINUTES;

/// Unix milliseconds — the only absolute time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Booking status ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 5] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
        BookingStatus::NoShow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Completed, cancelled and no-show bookings accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow
        )
    }

    /// Whether a booking in this status holds its interval against new reservations.
    pub fn occupies(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is placing a booking. Only staff may create a booking directly in `confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    PublicIntake,
    Staff,
}

// ── Configuration records ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Ulid,
    pub name: String,
    /// Rules of every service in this workspace are read in this zone.
    pub timezone: Tz,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceType {
    pub id: Ulid,
    pub workspace_id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub duration_minutes: u32,
    pub location: Option<String>,
    pub active: bool,
}

impl ServiceType {
    pub fn duration_ms(&self) -> Ms {
        Ms::from(self.duration_minutes) * MINUTE_MS
    }
}

/// A recurring weekly open window, in workspace-local wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub service_type_id: Ulid,
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub resource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Ulid,
    pub workspace_id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub workspace_id: Ulid,
    pub service_type_id: Ulid,
    pub contact_id: Ulid,
    pub scheduled_at: Ms,
    /// Copied from the service type at creation; later duration edits do not touch it.
    pub duration_minutes: u32,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn ends_at(&self) -> Ms {
        self.scheduled_at + Ms::from(self.duration_minutes) * MINUTE_MS
    }

    pub fn span(&self) -> Span {
        Span::new(self.scheduled_at, self.ends_at())
    }
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactInput {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub workspace_id: Ulid,
    pub service_type_id: Ulid,
    pub requested_at: Ms,
    pub contact: ContactInput,
    pub notes: Option<String>,
    pub origin: Origin,
    pub initial_status: BookingStatus,
}

impl BookingRequest {
    /// A public intake request: fresh id, no notes, starts `pending`.
    pub fn new(workspace_id: Ulid, service_type_id: Ulid, requested_at: Ms, contact: ContactInput) -> Self {
        Self {
            id: Ulid::new(),
            workspace_id,
            service_type_id,
            requested_at,
            contact,
            notes: None,
            origin: Origin::PublicIntake,
            initial_status: BookingStatus::Pending,
        }
    }

    pub fn with_id(mut self, id: Ulid) -> Self {
        self.id = id;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Staff booking; `confirmed` skips the pending stage.
    pub fn by_staff(mut self, initial_status: BookingStatus) -> Self {
        self.origin = Origin::Staff;
        self.initial_status = initial_status;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspacePatch {
    pub name: Option<String>,
    pub timezone: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTypePatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub location: Option<Option<String>>,
    pub duration_minutes: Option<u32>,
    pub active: Option<bool>,
}

/// Listing filter. `from` and `to` bound `scheduled_at` inclusively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub id: Option<Ulid>,
    pub status: Option<BookingStatus>,
    pub from: Option<Ms>,
    pub to: Option<Ms>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.id.is_none_or(|id| booking.id == id)
            && self.status.is_none_or(|s| booking.status == s)
            && self.from.is_none_or(|from| booking.scheduled_at >= from)
            && self.to.is_none_or(|to| booking.scheduled_at <= to)
    }
}

// ── Per-service state ────────────────────────────────────────────

/// Everything the reservation path needs for one service, guarded by one lock.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub service: ServiceType,
    /// Rules indexed by day of week, each list sorted by `start_time`.
    rules: [Vec<AvailabilityRule>; 7],
    /// All bookings ever made on this service, sorted by `scheduled_at`.
    pub bookings: Vec<Booking>,
}

impl ServiceState {
    pub fn new(service: ServiceType) -> Self {
        Self {
            service,
            rules: Default::default(),
            bookings: Vec::new(),
        }
    }

    pub fn rules_on(&self, day_of_week: u8) -> &[AvailabilityRule] {
        self.rules
            .get(usize::from(day_of_week))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All rules, ordered by day then start time.
    pub fn rules(&self) -> impl Iterator<Item = &AvailabilityRule> {
        self.rules.iter().flatten()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.iter().map(Vec::len).sum()
    }

    pub fn insert_rule(&mut self, rule: AvailabilityRule) {
        let Some(day) = self.rules.get_mut(usize::from(rule.day_of_week)) else {
            return;
        };
        let pos = day.partition_point(|r| r.start_time <= rule.start_time);
        day.insert(pos, rule);
    }

    pub fn remove_rule(&mut self, id: Ulid) -> Option<AvailabilityRule> {
        for day in &mut self.rules {
            if let Some(pos) = day.iter().position(|r| r.id == id) {
                return Some(day.remove(pos));
            }
        }
        None
    }

    /// Insert booking maintaining sort order by `scheduled_at`.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.scheduled_at <= booking.scheduled_at);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings (any status) whose interval overlaps the query window.
    /// No booking lasts longer than `MAX_DURATION_MINUTES`, so only those
    /// starting within that distance before `query.start` are scanned.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let earliest = query.start - Ms::from(MAX_DURATION_MINUTES) * MINUTE_MS;
        let left_bound = self.bookings.partition_point(|b| b.scheduled_at < earliest);
        let right_bound = self
            .bookings
            .partition_point(|b| b.scheduled_at < query.end);
        self.bookings[left_bound..right_bound]
            .iter()
            .filter(move |b| b.ends_at() > query.start)
    }
}

/// The WAL record format. Each variant is one committed state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    WorkspaceCreated { workspace: Workspace },
    WorkspaceUpdated { workspace: Workspace },
    ServiceTypeCreated { service: ServiceType },
    ServiceTypeUpdated { service: ServiceType },
    RuleAdded { rule: AvailabilityRule },
    RuleRemoved { id: Ulid, service_type_id: Ulid },
    ContactCreated { contact: Contact },
    /// `contact` is set when the reservation introduced a new contact, so both
    /// land in one record or not at all.
    BookingCreated { booking: Booking, contact: Option<Contact> },
    BookingStatusChanged {
        id: Ulid,
        service_type_id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
}

impl Event {
    /// The service whose state this event mutates, if any.
    pub fn service_type_id(&self) -> Option<Ulid> {
        match self {
            Event::ServiceTypeCreated { service } | Event::ServiceTypeUpdated { service } => {
                Some(service.id)
            }
            Event::RuleAdded { rule } => Some(rule.service_type_id),
            Event::RuleRemoved { service_type_id, .. }
            | Event::BookingStatusChanged { service_type_id, .. } => Some(*service_type_id),
            Event::BookingCreated { booking, .. } => Some(booking.service_type_id),
            Event::WorkspaceCreated { .. }
            | Event::WorkspaceUpdated { .. }
            | Event::ContactCreated { .. } => None,
        }
    }
}

// ── Boundary formatting ──────────────────────────────────────────

/// RFC 3339 in UTC, e.g. `2030-01-07T09:00:00Z`.
pub fn rfc3339(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => ms.to_string(),
    }
}

/// RFC 3339 with the offset of `tz` at that instant.
pub fn rfc3339_in(ms: Ms, tz: Tz) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt
            .with_timezone(&tz)
            .to_rfc3339_opts(SecondsFormat::Secs, false),
        None => ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceType {
        ServiceType {
            id: Ulid::new(),
            workspace_id: Ulid::new(),
            name: "Haircut".into(),
            description: None,
            duration_minutes: 30,
            location: None,
            active: true,
        }
    }

    fn booking_at(state: &ServiceState, start: Ms, minutes: u32, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            workspace_id: state.service.workspace_id,
            service_type_id: state.service.id,
            contact_id: Ulid::new(),
            scheduled_at: start,
            duration_minutes: minutes,
            status,
            notes: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn rule(day: u8, start: &str, end: &str) -> AvailabilityRule {
        AvailabilityRule {
            id: Ulid::new(),
            service_type_id: Ulid::new(),
            day_of_week: day,
            start_time: NaiveTime::parse_from_str(start, "%H:%M").unwrap(),
            end_time: NaiveTime::parse_from_str(end, "%H:%M").unwrap(),
            resource: None,
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // touching endpoints
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn status_parse_and_display() {
        for status in BookingStatus::ALL {
            assert_eq!(BookingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BookingStatus::parse("NO_SHOW"), Some(BookingStatus::NoShow));
        assert_eq!(BookingStatus::parse("noshow"), None);
        assert_eq!(BookingStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn only_pending_and_confirmed_occupy() {
        let occupying: Vec<_> = BookingStatus::ALL.into_iter().filter(|s| s.occupies()).collect();
        assert_eq!(occupying, vec![BookingStatus::Pending, BookingStatus::Confirmed]);
        assert!(BookingStatus::ALL.iter().all(|s| s.occupies() != s.is_terminal()));
    }

    #[test]
    fn bookings_kept_in_start_order() {
        let mut st = ServiceState::new(service());
        for start in [300, 100, 200] {
            let b = booking_at(&st, start * MINUTE_MS, 30, BookingStatus::Pending);
            st.insert_booking(b);
        }
        let starts: Vec<_> = st.bookings.iter().map(|b| b.scheduled_at / MINUTE_MS).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut st = ServiceState::new(service());
        let past = booking_at(&st, 0, 30, BookingStatus::Pending);
        let hit = booking_at(&st, 60 * MINUTE_MS, 30, BookingStatus::Pending);
        let future = booking_at(&st, 200 * MINUTE_MS, 30, BookingStatus::Pending);
        let hit_id = hit.id;
        st.insert_booking(past);
        st.insert_booking(hit);
        st.insert_booking(future);

        let query = Span::new(70 * MINUTE_MS, 120 * MINUTE_MS);
        let hits: Vec<_> = st.overlapping(&query).map(|b| b.id).collect();
        assert_eq!(hits, vec![hit_id]);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut st = ServiceState::new(service());
        let b = booking_at(&st, 0, 30, BookingStatus::Confirmed);
        st.insert_booking(b);
        let query = Span::new(30 * MINUTE_MS, 60 * MINUTE_MS);
        assert_eq!(st.overlapping(&query).count(), 0);
    }

    #[test]
    fn overlapping_long_booking_spanning_query() {
        let mut st = ServiceState::new(service());
        // Long booking made before a duration change still covers the query.
        let long = booking_at(&st, 0, 240, BookingStatus::Confirmed);
        let short = booking_at(&st, 30 * MINUTE_MS, 15, BookingStatus::Cancelled);
        st.insert_booking(long);
        st.insert_booking(short);
        let query = Span::new(120 * MINUTE_MS, 150 * MINUTE_MS);
        assert_eq!(st.overlapping(&query).count(), 1);
    }

    #[test]
    fn overlapping_reaches_back_one_max_duration() {
        let mut st = ServiceState::new(service());
        let max = Ms::from(MAX_DURATION_MINUTES) * MINUTE_MS;
        let longest = booking_at(&st, 0, MAX_DURATION_MINUTES, BookingStatus::Confirmed);
        let longest_id = longest.id;
        st.insert_booking(longest);

        let tail = Span::new(max - 30 * MINUTE_MS, max);
        assert_eq!(st.overlapping(&tail).map(|b| b.id).collect::<Vec<_>>(), vec![longest_id]);
        let after = Span::new(max, max + 30 * MINUTE_MS);
        assert_eq!(st.overlapping(&after).count(), 0);
    }

    #[test]
    fn rules_indexed_by_day_and_sorted() {
        let mut st = ServiceState::new(service());
        st.insert_rule(rule(1, "13:00", "17:00"));
        st.insert_rule(rule(1, "09:00", "12:00"));
        st.insert_rule(rule(3, "09:00", "12:00"));
        assert_eq!(st.rule_count(), 3);
        let monday: Vec<_> = st.rules_on(1).iter().map(|r| r.start_time.to_string()).collect();
        assert_eq!(monday, vec!["09:00:00", "13:00:00"]);
        assert!(st.rules_on(2).is_empty());
        assert!(st.rules_on(9).is_empty());
    }

    #[test]
    fn remove_rule_by_id() {
        let mut st = ServiceState::new(service());
        let r = rule(5, "10:00", "11:00");
        let id = r.id;
        st.insert_rule(r);
        assert!(st.remove_rule(Ulid::new()).is_none());
        assert_eq!(st.remove_rule(id).map(|r| r.id), Some(id));
        assert_eq!(st.rule_count(), 0);
    }

    #[test]
    fn filter_bounds_are_inclusive() {
        let st = ServiceState::new(service());
        let b = booking_at(&st, 1_000, 30, BookingStatus::Pending);
        let f = BookingFilter { from: Some(1_000), to: Some(1_000), ..Default::default() };
        assert!(f.matches(&b));
        let f = BookingFilter { status: Some(BookingStatus::Confirmed), ..Default::default() };
        assert!(!f.matches(&b));
    }

    #[test]
    fn rfc3339_rendering() {
        assert_eq!(rfc3339(1_894_006_800_000), "2030-01-07T09:00:00Z");
        assert_eq!(
            rfc3339_in(1_894_006_800_000, chrono_tz::America::New_York),
            "2030-01-07T04:00:00-05:00"
        );
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::WorkspaceCreated {
            workspace: Workspace {
                id: Ulid::new(),
                name: "Studio".into(),
                timezone: chrono_tz::Europe::Berlin,
                active: true,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);

        let event = Event::RuleAdded { rule: rule(1, "09:00", "10:00") };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
