mod conflict;
mod error;
mod mutations;
mod queries;
mod schedule;
mod slots;
mod status;
mod store;

pub use conflict::{overlaps, validate_disjoint, validate_no_overlap};
pub use error::EngineError;
pub use mutations::NewReservation;
pub use queries::{ScheduleQuery, ScheduleStats};
pub use schedule::{parse_interval, parse_time_range, WeeklySchedule};
pub use slots::{generate_slots, group_by_period, DayPeriod, PeriodGroups};
pub use status::Transition;
pub use store::{CoachState, DayBook};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::config::BookingPolicy;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedCoachState = Arc<RwLock<CoachState>>;
pub type SharedDayBook = Arc<RwLock<DayBook>>;
pub type SharedTicket = Arc<Mutex<UserTicket>>;

// ── Group-commit WAL channel ─────────────────────────────

type AppendAck = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: AppendAck,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL file. Appends that queue up while a flush is in progress are
/// committed together with one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, AppendAck)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray bytes don't join the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} records: {e}", batch.len());
    }
    for (_, ack) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = ack.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Engine ───────────────────────────────────────────────

/// Booking state of one facility.
///
/// Lock order is coach → day book → ticket. Every mutation also holds
/// `commit_gate` for reading, so compaction (which takes it for writing) sees
/// a consistent snapshot.
pub struct Engine {
    pub(super) coaches: DashMap<Ulid, SharedCoachState>,
    pub(super) days: DashMap<DayKey, SharedDayBook>,
    pub(super) tickets: DashMap<Ulid, SharedTicket>,
    /// Reservation id → the day book holding it.
    pub(super) reservation_index: DashMap<Ulid, DayKey>,
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) policy: BookingPolicy,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_options(wal_path, notify, BookingPolicy::default(), Arc::new(SystemClock))
    }

    /// Open the WAL at `wal_path`, rebuild state from it, and start the
    /// writer task. Must run inside a tokio runtime.
    pub fn with_options(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        policy: BookingPolicy,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            coaches: DashMap::new(),
            days: DashMap::new(),
            tickets: DashMap::new(),
            reservation_index: DashMap::new(),
            commit_gate: RwLock::new(()),
            wal_tx,
            notify,
            policy,
            clock,
        };

        let mut skipped = 0usize;
        for event in &events {
            if !engine.replay_event(event) {
                skipped += 1;
            }
        }
        if skipped > 0 {
            tracing::warn!("replay skipped {skipped} records that did not match state");
        }
        tracing::debug!(
            coaches = engine.coaches.len(),
            reservations = engine.reservation_index.len(),
            "replayed {} WAL records",
            events.len()
        );
        Ok(engine)
    }

    /// Apply one logged event during startup. Nothing else holds the Arcs yet,
    /// so `try_*` locking always succeeds; it may run inside an async context
    /// so blocking locks are off the table. Returns false if the event was
    /// dropped.
    fn replay_event(&self, event: &Event) -> bool {
        match event {
            Event::CoachCreated { id, name } => {
                let state = CoachState::new(*id, name.clone());
                self.coaches.insert(*id, Arc::new(RwLock::new(state)));
                true
            }
            Event::CoachDeleted { id } => {
                self.forget_coach(id);
                true
            }
            Event::WeeklyHoursSet { coach_id, .. } | Event::WeekReplaced { coach_id, .. } => {
                let Some(coach) = self.get_coach(coach_id) else {
                    return false;
                };
                let Ok(mut guard) = coach.try_write() else {
                    return false;
                };
                guard.apply_event(event);
                true
            }
            Event::TicketIssued {
                id,
                user_id,
                remaining_count,
                expires_at,
            } => {
                let ticket = UserTicket {
                    id: *id,
                    user_id: *user_id,
                    remaining_count: *remaining_count,
                    expires_at: *expires_at,
                };
                self.tickets.insert(*id, Arc::new(Mutex::new(ticket)));
                true
            }
            Event::ReservationCreated { reservation } | Event::ReservationRestored { reservation } => {
                let book = self.day_book_or_create(reservation.day_key());
                let Ok(mut guard) = book.try_write() else {
                    return false;
                };
                if matches!(event, Event::ReservationCreated { .. })
                    && let Some(ticket) = self.get_ticket_arc(&reservation.user_ticket_id)
                    && let Ok(mut t) = ticket.try_lock()
                {
                    apply_to_ticket(&mut t, event);
                }
                guard.apply_event(event);
                self.reservation_index.insert(reservation.id, reservation.day_key());
                true
            }
            Event::ReservationStatusChanged {
                coach_id,
                date,
                refund_ticket,
                ..
            } => {
                let key = DayKey {
                    coach_id: *coach_id,
                    date: *date,
                };
                let Some(book) = self.get_day_book(&key) else {
                    return false;
                };
                let Ok(mut guard) = book.try_write() else {
                    return false;
                };
                guard.apply_event(event);
                if let Some(ticket_id) = refund_ticket
                    && let Some(ticket) = self.get_ticket_arc(ticket_id)
                    && let Ok(mut t) = ticket.try_lock()
                {
                    apply_to_ticket(&mut t, event);
                }
                true
            }
        }
    }

    /// Drop a coach and everything filed under it.
    pub(super) fn forget_coach(&self, id: &Ulid) {
        self.coaches.remove(id);
        self.days.retain(|key, _| key.coach_id != *id);
        self.reservation_index.retain(|_, key| key.coach_id != *id);
    }

    /// Send one event to the background writer and wait for its fsync.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) async fn wal_control<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(build(tx))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }

    pub(super) fn get_coach(&self, id: &Ulid) -> Option<SharedCoachState> {
        self.coaches.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_day_book(&self, key: &DayKey) -> Option<SharedDayBook> {
        self.days.get(key).map(|e| e.value().clone())
    }

    pub(super) fn day_book_or_create(&self, key: DayKey) -> SharedDayBook {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DayBook::new(key))))
            .value()
            .clone()
    }

    /// Drop the book for `key` if it holds nothing and nobody else has it.
    /// Clones are taken under the map's shard lock, so a strong count of one
    /// inside `remove_if` means no other task can reach the book.
    pub(super) fn prune_day_book(&self, key: &DayKey) {
        self.days.remove_if(key, |_, book| {
            Arc::strong_count(book) == 1
                && book.try_read().is_ok_and(|guard| guard.reservations.is_empty())
        });
    }

    pub(super) fn get_ticket_arc(&self, id: &Ulid) -> Option<SharedTicket> {
        self.tickets.get(id).map(|e| e.value().clone())
    }

    /// Day books of one coach, ordered by date.
    pub(super) fn coach_day_books(&self, coach_id: &Ulid) -> Vec<(DayKey, SharedDayBook)> {
        let mut books: Vec<(DayKey, SharedDayBook)> = self
            .days
            .iter()
            .filter(|e| e.key().coach_id == *coach_id)
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        books.sort_by_key(|(key, _)| *key);
        books
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    pub fn today(&self) -> chrono::NaiveDate {
        self.clock.today()
    }

    /// Change feed for one coach's hours and reservations.
    pub fn subscribe(&self, coach_id: Ulid) -> broadcast::Receiver<Event> {
        self.notify.subscribe(coach_id)
    }

    /// Rewrite the WAL as the shortest event list that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let coaches: Vec<SharedCoachState> = self.coaches.iter().map(|e| e.value().clone()).collect();
        for coach in coaches {
            let guard = coach.read().await;
            if guard.deleted {
                continue;
            }
            events.push(Event::CoachCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            if !guard.schedule.is_empty() {
                events.push(Event::WeekReplaced {
                    coach_id: guard.id,
                    week: guard.schedule.to_week(),
                });
            }
        }

        let tickets: Vec<SharedTicket> = self.tickets.iter().map(|e| e.value().clone()).collect();
        for ticket in tickets {
            let t = ticket.lock().await;
            events.push(Event::TicketIssued {
                id: t.id,
                user_id: t.user_id,
                remaining_count: t.remaining_count,
                expires_at: t.expires_at,
            });
        }

        let books: Vec<SharedDayBook> = self.days.iter().map(|e| e.value().clone()).collect();
        for book in books {
            let guard = book.read().await;
            for r in &guard.reservations {
                events.push(Event::ReservationRestored {
                    reservation: r.clone(),
                });
            }
        }

        let count = events.len();
        self.wal_control(|response| WalCommand::Compact { events, response })
            .await?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("compacted WAL to {count} records");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal_control(|response| WalCommand::AppendsSinceCompact { response })
            .await
            .unwrap_or(0)
    }
}

/// Ticket side of a reservation event.
pub(super) fn apply_to_ticket(ticket: &mut UserTicket, event: &Event) {
    match event {
        Event::ReservationCreated { .. } => {
            ticket.remaining_count = ticket.remaining_count.saturating_sub(1);
        }
        Event::ReservationStatusChanged {
            refund_ticket: Some(id),
            ..
        } if *id == ticket.id => {
            ticket.remaining_count = ticket.remaining_count.saturating_add(1);
        }
        _ => {}
    }
}
