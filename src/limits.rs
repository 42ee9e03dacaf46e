use crate::model::Ms;

pub const MAX_WORKSPACES: usize = 10_000;
pub const MAX_SERVICE_TYPES_PER_WORKSPACE: usize = 1024;
pub const MAX_RULES_PER_SERVICE: usize = 512;
pub const MAX_BOOKINGS_PER_SERVICE: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2000;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 32;
pub const MIN_PHONE_DIGITS: usize = 7;
pub const MAX_PHONE_DIGITS: usize = 15;
pub const MAX_RESOURCE_LABEL_LEN: usize = 128;

/// One full day. Longer services cannot fit inside a single-day rule window.
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

/// Widest `scheduled_at` range a listing query may cover.
pub const MAX_LIST_RANGE_MS: Ms = 366 * 24 * 3_600_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_SQL_LEN: usize = 64 * 1024;
