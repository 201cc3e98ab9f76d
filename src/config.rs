use std::str::FromStr;

use crate::limits::{MAX_LESSON_MINUTES, MIN_LESSON_MINUTES};
use crate::model::Min;

/// Default lesson length used by the booking UI.
pub const DEFAULT_LESSON_MINUTES: Min = 20;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Process-level settings for the server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: String,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between automatic compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub policy: BookingPolicy,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind: std::env::var("COURTBOOK_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("COURTBOOK_PORT", 5433),
            data_dir: std::env::var("COURTBOOK_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            password: std::env::var("COURTBOOK_PASSWORD").unwrap_or_else(|_| "courtbook".into()),
            max_connections: env_or("COURTBOOK_MAX_CONNECTIONS", 256),
            compact_threshold: env_or("COURTBOOK_COMPACT_THRESHOLD", 1000),
            metrics_port: std::env::var("COURTBOOK_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            policy: BookingPolicy::from_env(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Booking rules the facility can tune.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    /// Slot length when a query does not name one.
    pub lesson_minutes: Min,
    /// Pending reservations block the slot for other bookers.
    pub pending_occupies_slot: bool,
    /// Cancelling a reservation credits its ticket back.
    pub refund_on_cancel: bool,
    /// Member bookings start as `pending` and wait for the coach.
    pub require_approval: bool,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            lesson_minutes: DEFAULT_LESSON_MINUTES,
            pending_occupies_slot: true,
            refund_on_cancel: true,
            require_approval: false,
        }
    }
}

impl BookingPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let lesson_minutes: Min = env_or("COURTBOOK_LESSON_MINUTES", defaults.lesson_minutes);
        Self {
            lesson_minutes: lesson_minutes.clamp(MIN_LESSON_MINUTES, MAX_LESSON_MINUTES),
            pending_occupies_slot: env_flag(
                "COURTBOOK_PENDING_OCCUPIES",
                defaults.pending_occupies_slot,
            ),
            refund_on_cancel: env_flag("COURTBOOK_REFUND_ON_CANCEL", defaults.refund_on_cancel),
            require_approval: env_flag("COURTBOOK_REQUIRE_APPROVAL", defaults.require_approval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_booking_ui() {
        let p = BookingPolicy::default();
        assert_eq!(p.lesson_minutes, 20);
        assert!(p.pending_occupies_slot);
        assert!(p.refund_on_cancel);
        assert!(!p.require_approval);
    }

    #[test]
    fn env_flag_falls_back_on_garbage() {
        // Key is never set by the test harness.
        assert!(env_flag("COURTBOOK_TEST_UNSET_FLAG", true));
        assert!(!env_flag("COURTBOOK_TEST_UNSET_FLAG", false));
    }
}
