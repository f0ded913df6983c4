//! Per-connection rate limiting.
//!
//! Each connection gets a 60-second window with two counters: every inbound
//! message counts toward the message cap, and every `automation_request`
//! additionally counts toward the automation cap. A cap of 0 disables that
//! counter.

// ============================================================================
// Imports
// ============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::identifiers::ConnectionId;

// ============================================================================
// Constants
// ============================================================================

/// Length of one rate window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// Types
// ============================================================================

/// Outcome of recording one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Under both caps.
    Allowed,
    /// Message cap exceeded.
    MessageLimitExceeded,
    /// Automation request cap exceeded.
    AutomationLimitExceeded,
}

impl RateDecision {
    /// Returns `true` for [`Allowed`](Self::Allowed).
    #[inline]
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone, Copy)]
struct RateState {
    window_start: Instant,
    message_count: u32,
    automation_count: u32,
}

// ============================================================================
// RateLimiter
// ============================================================================

/// Sliding-window counters keyed by connection.
#[derive(Debug)]
pub struct RateLimiter {
    max_messages: u32,
    max_automation: u32,
    state: Mutex<FxHashMap<ConnectionId, RateState>>,
}

impl RateLimiter {
    /// Creates a limiter; 0 disables a cap.
    #[must_use]
    pub fn new(max_messages: u32, max_automation: u32) -> Self {
        Self {
            max_messages,
            max_automation,
            state: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns `true` if any cap is set.
    #[inline]
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.max_messages > 0 || self.max_automation > 0
    }

    /// Counts one inbound message at `now`.
    pub fn record(&self, id: ConnectionId, is_automation: bool, now: Instant) -> RateDecision {
        if !self.is_enabled() {
            return RateDecision::Allowed;
        }

        let mut state = self.state.lock();
        let entry = state.entry(id).or_insert(RateState {
            window_start: now,
            message_count: 0,
            automation_count: 0,
        });

        if now.saturating_duration_since(entry.window_start) >= RATE_WINDOW {
            entry.window_start = now;
            entry.message_count = 0;
            entry.automation_count = 0;
        }

        entry.message_count = entry.message_count.saturating_add(1);
        if is_automation {
            entry.automation_count = entry.automation_count.saturating_add(1);
        }

        if self.max_messages > 0 && entry.message_count > self.max_messages {
            RateDecision::MessageLimitExceeded
        } else if is_automation
            && self.max_automation > 0
            && entry.automation_count > self.max_automation
        {
            RateDecision::AutomationLimitExceeded
        } else {
            RateDecision::Allowed
        }
    }

    /// Forgets a connection.
    pub fn remove(&self, id: ConnectionId) {
        self.state.lock().remove(&id);
    }

    /// Forgets every connection.
    pub fn clear(&self) {
        self.state.lock().clear();
    }

    /// Returns the number of tracked connections.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.state.lock().len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_allows_everything() {
        let limiter = RateLimiter::new(0, 0);
        let id = ConnectionId::next();
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(limiter.record(id, true, now).is_allowed());
        }
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn test_message_cap_trips_on_61st() {
        let limiter = RateLimiter::new(60, 0);
        let id = ConnectionId::next();
        let now = Instant::now();

        for _ in 0..60 {
            assert_eq!(limiter.record(id, false, now), RateDecision::Allowed);
        }
        assert_eq!(
            limiter.record(id, false, now),
            RateDecision::MessageLimitExceeded
        );
    }

    #[test]
    fn test_window_rolls_over() {
        let limiter = RateLimiter::new(2, 0);
        let id = ConnectionId::next();
        let start = Instant::now();

        assert!(limiter.record(id, false, start).is_allowed());
        assert!(limiter.record(id, false, start).is_allowed());
        assert!(!limiter.record(id, false, start + Duration::from_secs(59)).is_allowed());
        assert!(limiter.record(id, false, start + RATE_WINDOW).is_allowed());
    }

    #[test]
    fn test_automation_cap_independent() {
        let limiter = RateLimiter::new(0, 1);
        let id = ConnectionId::next();
        let now = Instant::now();

        assert!(limiter.record(id, true, now).is_allowed());
        assert!(limiter.record(id, false, now).is_allowed());
        assert_eq!(
            limiter.record(id, true, now),
            RateDecision::AutomationLimitExceeded
        );
    }

    #[test]
    fn test_connections_isolated() {
        let limiter = RateLimiter::new(1, 0);
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        let now = Instant::now();

        assert!(limiter.record(a, false, now).is_allowed());
        assert!(!limiter.record(a, false, now).is_allowed());
        assert!(limiter.record(b, false, now).is_allowed());

        limiter.remove(a);
        assert!(limiter.record(a, false, now).is_allowed());
        limiter.clear();
        assert_eq!(limiter.tracked(), 0);
    }
}
