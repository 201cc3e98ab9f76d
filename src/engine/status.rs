use crate::model::ReservationStatus;
use crate::model::ReservationStatus::*;

use super::EngineError;

/// Outcome of a requested status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Already in the requested status; nothing to write.
    Unchanged,
    Apply,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Completed | Cancelled | Rejected)
    }

    /// Whether a reservation in this status blocks its time range.
    pub fn occupies_slot(self, pending_occupies: bool) -> bool {
        match self {
            Confirmed | Completed => true,
            Pending => pending_occupies,
            Cancelled | Rejected => false,
        }
    }

    pub fn allowed_next(self) -> &'static [ReservationStatus] {
        match self {
            Pending => &[Confirmed, Rejected, Cancelled],
            Confirmed => &[Completed, Cancelled],
            Completed | Cancelled | Rejected => &[],
        }
    }

    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    /// Decide whether `self -> next` is a write, a no-op, or illegal.
    pub fn plan_transition(self, next: ReservationStatus) -> Result<Transition, EngineError> {
        if self == next {
            Ok(Transition::Unchanged)
        } else if self.can_transition_to(next) {
            Ok(Transition::Apply)
        } else {
            Err(EngineError::InvalidTransition { from: self, to: next })
        }
    }
}
