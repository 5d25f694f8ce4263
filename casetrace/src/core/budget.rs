//! Cooperative time budget of a meta block.

use std::time::{Duration, Instant};

/// Wall-clock deadline armed when a block is entered.
///
/// Expiry is only observed at checkpoints; code between checkpoints may run
/// past the nominal deadline. A timeout too large to represent never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
        }
    }

    /// Remaining budget, or `None` once the deadline has passed.
    ///
    /// An unbounded deadline reports `Duration::MAX`.
    pub fn remaining(&self) -> Option<Duration> {
        let Some(at) = self.at else {
            return Some(Duration::MAX);
        };
        at.checked_duration_since(Instant::now())
            .filter(|remaining| !remaining.is_zero())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_deadline_has_budget() {
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(!deadline.is_expired());
        assert!(deadline.remaining().expect("remaining") <= Duration::from_secs(60));
    }

    #[test]
    fn zero_budget_is_expired() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), None);
    }

    #[test]
    fn unrepresentable_budget_never_expires() {
        let deadline = Deadline::after(Duration::from_secs(u64::MAX));
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::MAX));
    }
}
