use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::slots::generate_slots;
use super::{Engine, EngineError};

/// Coach calendar filter.
#[derive(Debug, Clone)]
pub struct ScheduleQuery {
    pub coach_id: Ulid,
    pub from: NaiveDate,
    /// Inclusive.
    pub to: NaiveDate,
    pub include_cancelled: bool,
    /// Only this status. Overrides `include_cancelled`.
    pub status: Option<ReservationStatus>,
}

impl ScheduleQuery {
    pub fn new(coach_id: Ulid, from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            coach_id,
            from,
            to,
            include_cancelled: false,
            status: None,
        }
    }

    fn wants(&self, status: ReservationStatus) -> bool {
        match self.status {
            Some(only) => status == only,
            None => match status {
                ReservationStatus::Pending
                | ReservationStatus::Confirmed
                | ReservationStatus::Completed => true,
                ReservationStatus::Cancelled => self.include_cancelled,
                ReservationStatus::Rejected => false,
            },
        }
    }
}

/// Per-status totals shown above the calendar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub total: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub rejected: usize,
}

impl ScheduleStats {
    pub fn from_reservations(reservations: &[Reservation]) -> Self {
        let mut stats = Self {
            total: reservations.len(),
            ..Self::default()
        };
        for r in reservations {
            match r.status {
                ReservationStatus::Pending => stats.pending += 1,
                ReservationStatus::Confirmed => stats.confirmed += 1,
                ReservationStatus::Completed => stats.completed += 1,
                ReservationStatus::Cancelled => stats.cancelled += 1,
                ReservationStatus::Rejected => stats.rejected += 1,
            }
        }
        stats
    }
}

impl Engine {
    /// Slots for one coach on one date. `lesson_minutes` defaults to the
    /// facility policy.
    pub async fn available_slots(
        &self,
        coach_id: Ulid,
        date: NaiveDate,
        lesson_minutes: Option<Min>,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let lesson = lesson_minutes.unwrap_or(self.policy.lesson_minutes);
        if !(MIN_LESSON_MINUTES..=MAX_LESSON_MINUTES).contains(&lesson) {
            return Err(EngineError::LimitExceeded("lesson length out of range"));
        }
        let coach = self
            .get_coach(&coach_id)
            .ok_or(EngineError::NotFound(coach_id))?;
        let coach_guard = coach.read().await;
        if coach_guard.deleted {
            return Err(EngineError::NotFound(coach_id));
        }

        let key = DayKey { coach_id, date };
        let occupied = match self.get_day_book(&key) {
            Some(book) => book.read().await.occupied_spans(self.policy.pending_occupies_slot),
            None => Vec::new(),
        };
        let hours = coach_guard.schedule.get_day(DayOfWeek::of(date));
        Ok(generate_slots(hours, &occupied, lesson))
    }

    /// Weekly template rows, by day then start. `day = None` returns the
    /// whole week.
    pub async fn get_weekly_hours(
        &self,
        coach_id: Ulid,
        day: Option<DayOfWeek>,
    ) -> Result<Vec<WeeklyHoursInfo>, EngineError> {
        let coach = self
            .get_coach(&coach_id)
            .ok_or(EngineError::NotFound(coach_id))?;
        let guard = coach.read().await;
        let days: Vec<DayOfWeek> = match day {
            Some(d) => vec![d],
            None => DayOfWeek::all().collect(),
        };
        Ok(days
            .into_iter()
            .flat_map(|d| {
                guard.schedule.get_day(d).iter().map(move |iv| WeeklyHoursInfo {
                    coach_id,
                    day: d,
                    interval: *iv,
                })
            })
            .collect())
    }

    pub async fn list_coaches(&self) -> Vec<CoachInfo> {
        let coaches: Vec<_> = self.coaches.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(coaches.len());
        for coach in coaches {
            let guard = coach.read().await;
            if !guard.deleted {
                out.push(CoachInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                });
            }
        }
        out.sort_by_key(|c| c.id);
        out
    }

    pub async fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        let key = self.reservation_index.get(&id).map(|e| *e.value())?;
        let book = self.get_day_book(&key)?;
        let guard = book.read().await;
        guard.get(id).cloned()
    }

    /// Coach calendar over `[from, to]`, ordered by date then start time.
    pub async fn list_reservations(&self, query: &ScheduleQuery) -> Result<Vec<Reservation>, EngineError> {
        if query.from > query.to {
            return Err(EngineError::InvalidTimeRange(format!(
                "{} is after {}",
                query.from, query.to
            )));
        }
        if (query.to - query.from).num_days() >= MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }

        let mut out = Vec::new();
        for (key, book) in self.coach_day_books(&query.coach_id) {
            if key.date < query.from || key.date > query.to {
                continue;
            }
            let guard = book.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| query.wants(r.status))
                    .cloned(),
            );
        }
        Ok(out)
    }

    pub async fn get_ticket(&self, id: Ulid) -> Option<UserTicket> {
        let ticket = self.get_ticket_arc(&id)?;
        let guard = ticket.lock().await;
        Some(guard.clone())
    }

    /// A member's tickets, soonest expiry first. `active_only` keeps usable
    /// ones: credits left and not past `expires_at`.
    pub async fn member_tickets(&self, user_id: Ulid, active_only: bool) -> Vec<UserTicket> {
        let today = self.clock.today();
        let tickets: Vec<_> = self.tickets.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ticket in tickets {
            let t = ticket.lock().await;
            if t.user_id == user_id && (!active_only || t.is_active(today)) {
                out.push(t.clone());
            }
        }
        out.sort_by_key(|t| (t.expires_at, t.id));
        out
    }
}
