use ulid::Ulid;

use crate::model::*;

use super::schedule::WeeklySchedule;

/// Per-coach state guarded by the coach lock.
#[derive(Debug, Clone)]
pub struct CoachState {
    pub id: Ulid,
    pub name: Option<String>,
    pub schedule: WeeklySchedule,
    /// Set under the write lock when the coach is removed, so bookers that
    /// already hold the `Arc` see it.
    pub deleted: bool,
}

impl CoachState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            schedule: WeeklySchedule::new(),
            deleted: false,
        }
    }

    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::WeeklyHoursSet { day, intervals, .. } => {
                // Validated before the event was written.
                if self.schedule.set_day(*day, intervals).is_err() {
                    tracing::warn!(coach = %self.id, "skipping invalid weekly hours record");
                }
            }
            Event::WeekReplaced { week, .. } => {
                if self.schedule.replace_week(week).is_err() {
                    tracing::warn!(coach = %self.id, "skipping invalid week record");
                }
            }
            Event::CoachDeleted { .. } => self.deleted = true,
            _ => {}
        }
    }
}

/// All reservations of one coach on one date, any status.
#[derive(Debug, Clone)]
pub struct DayBook {
    pub key: DayKey,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl DayBook {
    pub fn new(key: DayKey) -> Self {
        Self {
            key,
            reservations: Vec::new(),
        }
    }

    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    fn get_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations whose span intersects `query`, any status.
    pub fn overlapping<'a>(&'a self, query: &'a Span) -> impl Iterator<Item = &'a Reservation> + 'a {
        let right = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Spans that block slots under the given pending policy.
    pub fn occupied_spans(&self, pending_occupies: bool) -> Vec<Span> {
        self.reservations
            .iter()
            .filter(|r| r.status.occupies_slot(pending_occupies))
            .map(|r| r.span)
            .collect()
    }

    pub fn has_open_reservations(&self) -> bool {
        self.reservations.iter().any(|r| !r.status.is_terminal())
    }

    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } | Event::ReservationRestored { reservation } => {
                self.insert(reservation.clone());
            }
            Event::ReservationStatusChanged {
                id, status, reason, ..
            } => {
                if let Some(r) = self.get_mut(*id) {
                    r.status = *status;
                    r.status_reason = reason.clone();
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn reservation(start: &str, end: &str, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            coach_id: Ulid::nil(),
            user_id: Ulid::new(),
            user_ticket_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2025, 8, 25).unwrap(),
            span: Span::parse(start, end).unwrap(),
            status,
            memo: None,
            status_reason: None,
        }
    }

    fn book() -> DayBook {
        DayBook::new(DayKey {
            coach_id: Ulid::nil(),
            date: NaiveDate::from_ymd_opt(2025, 8, 25).unwrap(),
        })
    }

    #[test]
    fn insert_keeps_start_order() {
        let mut b = book();
        b.insert(reservation("10:00", "10:20", ReservationStatus::Confirmed));
        b.insert(reservation("09:00", "09:20", ReservationStatus::Confirmed));
        b.insert(reservation("09:40", "10:00", ReservationStatus::Cancelled));
        let starts: Vec<Min> = b.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![540, 580, 600]);
    }

    #[test]
    fn overlapping_excludes_adjacent() {
        let mut b = book();
        b.insert(reservation("09:00", "09:20", ReservationStatus::Confirmed));
        b.insert(reservation("09:20", "09:40", ReservationStatus::Confirmed));
        b.insert(reservation("09:40", "10:00", ReservationStatus::Confirmed));
        let q = Span::parse("09:20", "09:40").unwrap();
        assert_eq!(b.overlapping(&q).count(), 1);
        let wide = Span::parse("09:10", "09:50").unwrap();
        assert_eq!(b.overlapping(&wide).count(), 3);
    }

    #[test]
    fn occupied_spans_respect_pending_policy() {
        let mut b = book();
        b.insert(reservation("09:00", "09:20", ReservationStatus::Pending));
        b.insert(reservation("09:20", "09:40", ReservationStatus::Cancelled));
        b.insert(reservation("09:40", "10:00", ReservationStatus::Completed));
        assert_eq!(b.occupied_spans(true).len(), 2);
        assert_eq!(b.occupied_spans(false).len(), 1);
        assert!(b.has_open_reservations());
    }

    #[test]
    fn status_change_updates_record() {
        let mut b = book();
        let r = reservation("09:00", "09:20", ReservationStatus::Confirmed);
        let id = r.id;
        b.apply_event(&Event::ReservationCreated { reservation: r });
        b.apply_event(&Event::ReservationStatusChanged {
            id,
            coach_id: Ulid::nil(),
            date: b.key.date,
            status: ReservationStatus::Cancelled,
            reason: Some("rain".into()),
            refund_ticket: None,
        });
        let got = b.get(id).unwrap();
        assert_eq!(got.status, ReservationStatus::Cancelled);
        assert_eq!(got.status_reason.as_deref(), Some("rain"));
        assert!(!b.has_open_reservations());
    }
}
