use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since local midnight.
pub type Min = u16;

/// Parse a strict 24h `HH:MM` string.
pub fn parse_hhmm(s: &str) -> Option<Min> {
    let bytes = s.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    if !bytes[..2].iter().chain(&bytes[3..]).all(u8::is_ascii_digit) {
        return None;
    }
    let hours: Min = s[..2].parse().ok()?;
    let minutes: Min = s[3..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

pub fn format_hhmm(m: Min) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Parse a `YYYY-MM-DD` calendar date.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// Half-open interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Min,
    pub end: Min,
}

impl Span {
    pub fn new(start: Min, end: Min) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor: `None` unless `start < end`.
    pub fn try_new(start: Min, end: Min) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Parse two `HH:MM` strings into a span. `None` if either is malformed
    /// or `start >= end`.
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        Self::try_new(parse_hhmm(start)?, parse_hhmm(end)?)
    }

    pub fn minutes(&self) -> Min {
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

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_hhmm(self.start), format_hhmm(self.end))
    }
}

/// Day of week, Sunday = 0 through Saturday = 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayOfWeek(u8);

impl DayOfWeek {
    pub const SUNDAY: DayOfWeek = DayOfWeek(0);
    pub const MONDAY: DayOfWeek = DayOfWeek(1);
    pub const TUESDAY: DayOfWeek = DayOfWeek(2);
    pub const WEDNESDAY: DayOfWeek = DayOfWeek(3);
    pub const THURSDAY: DayOfWeek = DayOfWeek(4);
    pub const FRIDAY: DayOfWeek = DayOfWeek(5);
    pub const SATURDAY: DayOfWeek = DayOfWeek(6);

    pub fn new(n: u8) -> Option<Self> {
        (n < 7).then_some(Self(n))
    }

    pub fn of(date: NaiveDate) -> Self {
        Self(date.weekday().num_days_from_sunday() as u8)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn all() -> impl Iterator<Item = DayOfWeek> {
        (0..7).map(DayOfWeek)
    }
}

/// One entry of a coach's weekly template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoursInterval {
    pub span: Span,
    pub available: bool,
}

impl HoursInterval {
    pub fn open(span: Span) -> Self {
        Self { span, available: true }
    }

    pub fn closed(span: Span) -> Self {
        Self { span, available: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    Rejected,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "completed" => Some(ReservationStatus::Completed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            "rejected" => Some(ReservationStatus::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub coach_id: Ulid,
    pub user_id: Ulid,
    pub user_ticket_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: ReservationStatus,
    pub memo: Option<String>,
    /// Reason attached to the latest status change, if any.
    pub status_reason: Option<String>,
}

impl Reservation {
    pub fn day_key(&self) -> DayKey {
        DayKey {
            coach_id: self.coach_id,
            date: self.date,
        }
    }
}

/// Lesson-credit ledger entry held by a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTicket {
    pub id: Ulid,
    pub user_id: Ulid,
    pub remaining_count: u32,
    /// Last day (inclusive) the ticket can be used.
    pub expires_at: NaiveDate,
}

impl UserTicket {
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expires_at < today
    }

    pub fn is_active(&self, today: NaiveDate) -> bool {
        self.remaining_count > 0 && !self.is_expired(today)
    }
}

/// Key of the shared mutable reservation set: one coach on one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayKey {
    pub coach_id: Ulid,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Available,
    Unavailable,
}

impl SlotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Unavailable => "unavailable",
        }
    }
}

/// A bookable lesson window for one concrete date. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSlot {
    pub span: Span,
    pub status: SlotStatus,
    pub duration_label: Option<String>,
}

impl TimeSlot {
    pub fn start(&self) -> String {
        format_hhmm(self.span.start)
    }

    pub fn end(&self) -> String {
        format_hhmm(self.span.end)
    }

    pub fn is_available(&self) -> bool {
        self.status == SlotStatus::Available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Member,
    Coach,
    FacilityAdmin,
}

/// Explicit identity of whoever issues a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Ulid,
    pub role: Role,
}

impl Caller {
    pub fn member(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Member }
    }

    pub fn coach(coach_id: Ulid) -> Self {
        Self { user_id: coach_id, role: Role::Coach }
    }

    pub fn facility_admin(user_id: Ulid) -> Self {
        Self { user_id, role: Role::FacilityAdmin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::FacilityAdmin
    }

    /// Coaches and admins act on behalf of the facility.
    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Coach | Role::FacilityAdmin)
    }
}

/// WAL record format. One event per committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CoachCreated {
        id: Ulid,
        name: Option<String>,
    },
    CoachDeleted {
        id: Ulid,
    },
    WeeklyHoursSet {
        coach_id: Ulid,
        day: DayOfWeek,
        intervals: Vec<HoursInterval>,
    },
    /// Whole-week replacement; `week[d]` holds the intervals for day `d`.
    WeekReplaced {
        coach_id: Ulid,
        week: Vec<Vec<HoursInterval>>,
    },
    TicketIssued {
        id: Ulid,
        user_id: Ulid,
        remaining_count: u32,
        expires_at: NaiveDate,
    },
    /// Carries the full record; applying it also consumes one ticket credit.
    ReservationCreated {
        reservation: Reservation,
    },
    /// Snapshot form written by compaction; does not touch the ticket.
    ReservationRestored {
        reservation: Reservation,
    },
    ReservationStatusChanged {
        id: Ulid,
        coach_id: Ulid,
        date: NaiveDate,
        status: ReservationStatus,
        reason: Option<String>,
        /// Ticket credited back by this change.
        refund_ticket: Option<Ulid>,
    },
}

impl Event {
    /// Coach whose change feed this event belongs to.
    pub fn coach_id(&self) -> Option<Ulid> {
        match self {
            Event::CoachCreated { id, .. } | Event::CoachDeleted { id } => Some(*id),
            Event::WeeklyHoursSet { coach_id, .. }
            | Event::WeekReplaced { coach_id, .. }
            | Event::ReservationStatusChanged { coach_id, .. } => Some(*coach_id),
            Event::ReservationCreated { reservation }
            | Event::ReservationRestored { reservation } => Some(reservation.coach_id),
            Event::TicketIssued { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoachInfo {
    pub id: Ulid,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklyHoursInfo {
    pub coach_id: Ulid,
    pub day: DayOfWeek,
    pub interval: HoursInterval,
}
