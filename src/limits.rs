//! Hard limits enforced by the engine and the facility manager.

pub const MAX_FACILITIES: usize = 64;
pub const MAX_FACILITY_NAME_LEN: usize = 128;

pub const MAX_COACHES_PER_FACILITY: usize = 1_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_MEMO_LEN: usize = 1_024;

/// Intervals a coach may configure on a single weekday.
pub const MAX_INTERVALS_PER_DAY: usize = 48;

/// Reservations (any status) kept on one coach/date day book.
pub const MAX_RESERVATIONS_PER_DAY: usize = 512;

pub const MAX_TICKETS_PER_FACILITY: usize = 100_000;

pub const MIN_LESSON_MINUTES: u16 = 5;
pub const MAX_LESSON_MINUTES: u16 = 240;

/// Widest date range a calendar query may span.
pub const MAX_QUERY_DAYS: i64 = 62;
