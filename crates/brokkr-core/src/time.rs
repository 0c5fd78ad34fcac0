//! Monotonic time source and deadline arithmetic
//!
//! All deadlines in this crate are expressed as monotonic nanoseconds
//! relative to a process-wide anchor captured on first use. Wall-clock
//! time is never consulted, so deadlines are immune to clock adjustments.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use thiserror::Error;

/// The error returned when a deadline query finds the deadline in the past.
#[derive(Debug, Clone, Copy, Error)]
#[error("deadline {deadline_nanos}ns exceeded at {observed_nanos}ns")]
pub struct DeadlineExceeded {
    /// The deadline that was missed, in monotonic nanos.
    pub deadline_nanos: i64,
    /// The instant of observation, in monotonic nanos.
    pub observed_nanos: i64,
}

impl DeadlineExceeded {
    /// How far past the deadline the observation was.
    pub fn excess_nanos(&self) -> i64 {
        self.observed_nanos.saturating_sub(self.deadline_nanos)
    }
}

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Current monotonic time in nanoseconds since the process anchor.
pub fn now_nanos() -> i64 {
    // Instant::elapsed is non-decreasing; i64 nanos covers ~292 years.
    anchor().elapsed().as_nanos().min(i64::MAX as u128) as i64
}

/// Absolute deadline for a timeout starting now.
pub fn deadline_nanos(timeout: Duration) -> i64 {
    deadline_from(now_nanos(), timeout)
}

/// Absolute deadline for a timeout starting at `start_nanos`.
///
/// Saturates at `i64::MAX` instead of overflowing.
pub fn deadline_from(start_nanos: i64, timeout: Duration) -> i64 {
    let timeout_nanos = timeout.as_nanos().min(i64::MAX as u128) as i64;
    start_nanos.saturating_add(timeout_nanos)
}

/// Signed time remaining until `deadline_nanos`; negative once past it.
pub fn remaining_nanos(deadline_nanos: i64) -> i64 {
    deadline_nanos.saturating_sub(now_nanos())
}

/// Non-negative time remaining until `deadline_nanos`.
///
/// Fails once the current instant is at or past the deadline.
pub fn remaining_duration(deadline_nanos: i64) -> Result<Duration, DeadlineExceeded> {
    let now = now_nanos();
    let remaining = deadline_nanos.saturating_sub(now);
    if remaining <= 0 {
        Err(DeadlineExceeded {
            deadline_nanos,
            observed_nanos: now,
        })
    } else {
        Ok(Duration::from_nanos(remaining as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
    }

    #[test]
    fn deadline_saturates_instead_of_overflowing() {
        assert_eq!(deadline_from(i64::MAX - 1, Duration::from_secs(1)), i64::MAX);
        assert_eq!(deadline_nanos(Duration::MAX), i64::MAX);
    }

    #[test]
    fn remaining_is_signed() {
        let past = now_nanos() - 1_000_000;
        assert!(remaining_nanos(past) < 0);
        let future = now_nanos() + 1_000_000_000;
        assert!(remaining_nanos(future) > 0);
    }

    #[test]
    fn remaining_duration_fails_at_or_past_deadline() {
        let past = now_nanos();
        let err = remaining_duration(past).unwrap_err();
        assert!(err.excess_nanos() >= 0);

        let future = now_nanos() + 10_000_000_000;
        assert!(remaining_duration(future).is_ok());
    }
}
