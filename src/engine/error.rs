use thiserror::Error;
use ulid::Ulid;

use crate::model::{ReservationStatus, Span};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),

    #[error("interval overlaps existing interval {conflicting}")]
    Overlap { conflicting: Span },

    #[error("slot unavailable{}", held_by(.conflicting))]
    SlotUnavailable { conflicting: Option<Ulid> },

    #[error("ticket {0} has no lessons remaining")]
    TicketExhausted(Ulid),

    #[error("ticket {0} has expired")]
    TicketExpired(Ulid),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },

    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("coach {0} still has active reservations")]
    HasReservations(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

fn held_by(conflicting: &Option<Ulid>) -> String {
    conflicting
        .map(|id| format!(": held by reservation {id}"))
        .unwrap_or_default()
}

impl EngineError {
    /// Validation failures the caller can fix by changing the request.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidTimeRange(_)
                | EngineError::Overlap { .. }
                | EngineError::SlotUnavailable { .. }
                | EngineError::TicketExhausted(_)
                | EngineError::TicketExpired(_)
                | EngineError::InvalidTransition { .. }
        )
    }

    /// Short stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidTimeRange(_) => "invalid_time_range",
            EngineError::Overlap { .. } => "overlap",
            EngineError::SlotUnavailable { .. } => "slot_unavailable",
            EngineError::TicketExhausted(_) => "ticket_exhausted",
            EngineError::TicketExpired(_) => "ticket_expired",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::HasReservations(_) => "has_reservations",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}
