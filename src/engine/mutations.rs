use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::check_no_conflict;
use super::schedule::WeeklySchedule;
use super::slots::generate_slots;
use super::status::Transition;
use super::{apply_to_ticket, CoachState, Engine, EngineError};

/// Booking request as submitted by a member or by staff on a member's behalf.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub id: Ulid,
    pub coach_id: Ulid,
    pub user_id: Ulid,
    pub user_ticket_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub memo: Option<String>,
    /// Book outside the weekly hours and slot grid. Facility admins only.
    pub override_hours: bool,
}

impl Engine {
    // ── Coaches & weekly hours ───────────────────────────────

    pub async fn create_coach(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if self.coaches.len() >= MAX_COACHES_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many coaches"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("coach name too long"));
        }
        if self.coaches.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::CoachCreated {
            id,
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        self.coaches
            .insert(id, Arc::new(RwLock::new(CoachState::new(id, name))));
        self.notify.publish(&event);
        tracing::info!(coach = %id, "coach created");
        Ok(())
    }

    /// Remove a coach. Refused while any of their reservations is still
    /// pending or confirmed.
    pub async fn delete_coach(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let coach = self.get_coach(&id).ok_or(EngineError::NotFound(id))?;
        // Bookers take the coach read lock first, so holding the write lock
        // keeps new reservations out while the day books are inspected.
        let mut guard = coach.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        for (_, book) in self.coach_day_books(&id) {
            if book.read().await.has_open_reservations() {
                return Err(EngineError::HasReservations(id));
            }
        }

        let event = Event::CoachDeleted { id };
        self.wal_append(&event).await?;
        guard.apply_event(&event);
        self.forget_coach(&id);
        self.notify.publish(&event);
        self.notify.remove(&id);
        tracing::info!(coach = %id, "coach deleted");
        Ok(())
    }

    /// Replace one weekday of a coach's template.
    pub async fn set_weekly_hours(
        &self,
        coach_id: Ulid,
        day: DayOfWeek,
        intervals: Vec<HoursInterval>,
    ) -> Result<(), EngineError> {
        let intervals = WeeklySchedule::validate_day(&intervals)?;
        self.edit_schedule(
            coach_id,
            Event::WeeklyHoursSet {
                coach_id,
                day,
                intervals,
            },
        )
        .await
    }

    /// Replace the whole week at once; `week[d]` is day `d`, Sunday first.
    pub async fn replace_weekly_hours(
        &self,
        coach_id: Ulid,
        week: Vec<Vec<HoursInterval>>,
    ) -> Result<(), EngineError> {
        let week = WeeklySchedule::validate_week(&week)?.to_vec();
        self.edit_schedule(coach_id, Event::WeekReplaced { coach_id, week })
            .await
    }

    pub async fn clear_weekly_day(&self, coach_id: Ulid, day: DayOfWeek) -> Result<(), EngineError> {
        self.set_weekly_hours(coach_id, day, Vec::new()).await
    }

    pub async fn clear_weekly_hours(&self, coach_id: Ulid) -> Result<(), EngineError> {
        self.replace_weekly_hours(coach_id, vec![Vec::new(); 7]).await
    }

    async fn edit_schedule(&self, coach_id: Ulid, event: Event) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let coach = self
            .get_coach(&coach_id)
            .ok_or(EngineError::NotFound(coach_id))?;
        let mut guard = coach.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(coach_id));
        }
        self.wal_append(&event).await?;
        guard.apply_event(&event);
        self.notify.publish(&event);
        Ok(())
    }

    // ── Tickets ──────────────────────────────────────────────

    pub async fn issue_ticket(
        &self,
        id: Ulid,
        user_id: Ulid,
        remaining_count: u32,
        expires_at: NaiveDate,
    ) -> Result<UserTicket, EngineError> {
        let _gate = self.commit_gate.read().await;
        if self.tickets.len() >= MAX_TICKETS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many tickets"));
        }
        if self.tickets.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::TicketIssued {
            id,
            user_id,
            remaining_count,
            expires_at,
        };
        self.wal_append(&event).await?;
        let ticket = UserTicket {
            id,
            user_id,
            remaining_count,
            expires_at,
        };
        self.tickets
            .insert(id, Arc::new(Mutex::new(ticket.clone())));
        Ok(ticket)
    }

    // ── Reservations ─────────────────────────────────────────

    /// Validate and book a lesson. Runs under the `(coach, date)` write lock
    /// so two bookers of the same day are strictly ordered; on any error the
    /// day book and the ticket are left as they were.
    pub async fn create_reservation(
        &self,
        caller: &Caller,
        req: NewReservation,
    ) -> Result<Reservation, EngineError> {
        let result = self.try_create_reservation(caller, req).await;
        match &result {
            Ok(r) => {
                metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL, "status" => r.status.as_str())
                    .increment(1);
            }
            Err(e) => {
                metrics::counter!(observability::BOOKING_REJECTIONS_TOTAL, "reason" => e.kind())
                    .increment(1);
                if !e.is_validation() {
                    tracing::warn!("reservation failed: {e}");
                }
            }
        }
        result
    }

    async fn try_create_reservation(
        &self,
        caller: &Caller,
        req: NewReservation,
    ) -> Result<Reservation, EngineError> {
        if caller.role == Role::Member && caller.user_id != req.user_id {
            return Err(EngineError::Forbidden("members may only book for themselves"));
        }
        if req.override_hours && !caller.is_admin() {
            return Err(EngineError::Forbidden("hours override requires a facility admin"));
        }
        if req.span.start >= req.span.end || req.span.end >= 24 * 60 {
            return Err(EngineError::InvalidTimeRange(req.span.to_string()));
        }
        if let Some(ref memo) = req.memo
            && memo.len() > MAX_MEMO_LEN
        {
            return Err(EngineError::LimitExceeded("memo too long"));
        }

        let _gate = self.commit_gate.read().await;
        let id = req.id;
        let key = DayKey {
            coach_id: req.coach_id,
            date: req.date,
        };
        // Claim the id before anything else so two bookers of the same id on
        // different days cannot both get through.
        match self.reservation_index.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(key);
            }
        }

        let result = self.book_claimed(caller, req, key).await;
        if result.is_err() {
            self.reservation_index.remove(&id);
            self.prune_day_book(&key);
        }
        result
    }

    /// Steps (a) to (d) of a booking whose id is already claimed in the index.
    async fn book_claimed(
        &self,
        caller: &Caller,
        req: NewReservation,
        key: DayKey,
    ) -> Result<Reservation, EngineError> {
        let coach = self
            .get_coach(&req.coach_id)
            .ok_or(EngineError::NotFound(req.coach_id))?;
        let coach_guard = coach.read().await;
        if coach_guard.deleted {
            return Err(EngineError::NotFound(req.coach_id));
        }

        let book = self.day_book_or_create(key);
        let mut guard = book.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many reservations on this day"));
        }
        let pending_occupies = self.policy.pending_occupies_slot;

        // (a) the requested span must be an open slot of the day's grid
        if !req.override_hours {
            let hours = coach_guard.schedule.get_day(DayOfWeek::of(req.date));
            let occupied = guard.occupied_spans(pending_occupies);
            let slots = generate_slots(hours, &occupied, req.span.minutes());
            match slots.iter().find(|s| s.span == req.span) {
                Some(slot) if slot.is_available() => {}
                Some(_) => {
                    // Report the holder when it is on the record.
                    check_no_conflict(&guard, &req.span, pending_occupies, None)?;
                    return Err(EngineError::SlotUnavailable { conflicting: None });
                }
                None => return Err(EngineError::SlotUnavailable { conflicting: None }),
            }
        }

        // (b) ticket
        let ticket = self
            .get_ticket_arc(&req.user_ticket_id)
            .ok_or(EngineError::NotFound(req.user_ticket_id))?;
        let mut ticket_guard = ticket.lock().await;
        if ticket_guard.user_id != req.user_id {
            return Err(EngineError::Forbidden("ticket belongs to another member"));
        }
        if ticket_guard.remaining_count == 0 {
            return Err(EngineError::TicketExhausted(ticket_guard.id));
        }
        if ticket_guard.is_expired(self.clock.today()) {
            return Err(EngineError::TicketExpired(ticket_guard.id));
        }

        // (c) no occupying reservation overlaps
        check_no_conflict(&guard, &req.span, pending_occupies, None)?;

        // (d) commit
        let status = if caller.role == Role::Member && self.policy.require_approval {
            ReservationStatus::Pending
        } else {
            ReservationStatus::Confirmed
        };
        let reservation = Reservation {
            id: req.id,
            coach_id: req.coach_id,
            user_id: req.user_id,
            user_ticket_id: req.user_ticket_id,
            date: req.date,
            span: req.span,
            status,
            memo: req.memo,
            status_reason: None,
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.wal_append(&event).await?;
        guard.apply_event(&event);
        apply_to_ticket(&mut ticket_guard, &event);
        self.notify.publish(&event);

        tracing::info!(
            reservation = %reservation.id,
            coach = %reservation.coach_id,
            date = %reservation.date,
            span = %reservation.span,
            status = %reservation.status,
            "reservation created"
        );
        Ok(reservation)
    }

    /// Move a reservation through its lifecycle. Asking for the status it
    /// already has returns it unchanged.
    pub async fn update_status(
        &self,
        caller: &Caller,
        id: Ulid,
        status: ReservationStatus,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        if let Some(ref r) = reason
            && r.len() > MAX_MEMO_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }

        let _gate = self.commit_gate.read().await;
        let key = self
            .reservation_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let book = self.get_day_book(&key).ok_or(EngineError::NotFound(id))?;
        let mut guard = book.write().await;
        let current = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;

        authorize_status_change(caller, &current, status)?;
        if matches!(status, ReservationStatus::Pending | ReservationStatus::Rejected) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: status,
            });
        }
        if current.status.plan_transition(status)? == Transition::Unchanged {
            return Ok(current);
        }

        if current.status == ReservationStatus::Pending
            && status == ReservationStatus::Confirmed
            && !self.policy.pending_occupies_slot
        {
            check_no_conflict(&guard, &current.span, false, Some(id))?;
        }

        let refund_ticket = (status == ReservationStatus::Cancelled && self.policy.refund_on_cancel)
            .then_some(current.user_ticket_id);
        let ticket = match refund_ticket {
            Some(ticket_id) => {
                let arc = self.get_ticket_arc(&ticket_id);
                if arc.is_none() {
                    tracing::warn!(reservation = %id, ticket = %ticket_id, "refund target missing");
                }
                arc
            }
            None => None,
        };
        let mut ticket_guard = match &ticket {
            Some(t) => Some(t.lock().await),
            None => None,
        };

        let event = Event::ReservationStatusChanged {
            id,
            coach_id: key.coach_id,
            date: key.date,
            status,
            reason,
            refund_ticket: ticket_guard.as_ref().map(|t| t.id),
        };
        self.wal_append(&event).await?;
        guard.apply_event(&event);
        if let Some(t) = ticket_guard.as_deref_mut() {
            apply_to_ticket(t, &event);
        }
        self.notify.publish(&event);
        metrics::counter!(observability::STATUS_CHANGES_TOTAL, "status" => status.as_str())
            .increment(1);
        tracing::info!(reservation = %id, from = %current.status, to = %status, "status changed");

        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Cancel with a default reason naming who cancelled.
    pub async fn cancel_reservation(
        &self,
        caller: &Caller,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let reason = reason.or_else(|| {
            Some(match caller.role {
                Role::Member => "cancelled by member".to_string(),
                Role::Coach | Role::FacilityAdmin => "cancelled by coach".to_string(),
            })
        });
        self.update_status(caller, id, ReservationStatus::Cancelled, reason)
            .await
    }
}

fn authorize_status_change(
    caller: &Caller,
    reservation: &Reservation,
    status: ReservationStatus,
) -> Result<(), EngineError> {
    match caller.role {
        Role::FacilityAdmin => Ok(()),
        Role::Coach if caller.user_id == reservation.coach_id => Ok(()),
        Role::Coach => Err(EngineError::Forbidden("not this coach's reservation")),
        Role::Member if caller.user_id != reservation.user_id => {
            Err(EngineError::Forbidden("not your reservation"))
        }
        Role::Member if status != ReservationStatus::Cancelled => {
            Err(EngineError::Forbidden("members may only cancel"))
        }
        Role::Member => Ok(()),
    }
}
