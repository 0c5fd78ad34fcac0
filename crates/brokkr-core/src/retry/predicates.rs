//! Retry decisions and the predicate shapes that produce them
//!
//! Predicates come in two coordinate systems: deadline-free
//! ([`RetryPredicate`]) and deadline-aware ([`TimeoutRetryPredicate`],
//! which may block to implement its delay). [`AdvancedRetryPredicate`]
//! adds the immediate/delayed distinction a backoff register needs, and
//! [`TimeoutDelayPredicate`] is the compact signed-millis form. Adapters
//! between the shapes are concrete structs, not trait inheritance.

use std::error::Error;
use std::time::Duration;

use thiserror::Error as ThisError;

use crate::causes::first_cause;
use crate::interrupt::{self, Interrupted};
use crate::time::DeadlineExceeded;

/// What the retry driver should do with the inspected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again.
    Retry,
    /// Stop; hand the value (or failure) back to the caller.
    Abort,
}

/// A decision with backoff granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvancedDecision {
    /// Retry under the default policy (immediate budget, then delayed).
    Retry,
    /// Retry without consuming the backoff register.
    RetryImmediate,
    /// Retry, but skip any remaining zero-delay budget for this failure
    /// class (pointless for e.g. resource exhaustion).
    RetryDelayed,
    /// Stop.
    Abort,
}

/// A failure raised by a predicate instead of a decision.
#[derive(Debug, ThisError)]
pub enum RetryFault {
    /// The worker was interrupted while the predicate was delaying.
    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    /// A deadline-aware predicate found the deadline in the past.
    #[error(transparent)]
    DeadlineExceeded(#[from] DeadlineExceeded),
}

/// Deadline-free retry classification.
pub trait RetryPredicate<T> {
    /// Decide whether `value` warrants another attempt.
    fn decide(&mut self, value: &T) -> Result<RetryDecision, RetryFault>;
}

impl<T, F> RetryPredicate<T> for F
where
    F: FnMut(&T) -> RetryDecision,
{
    fn decide(&mut self, value: &T) -> Result<RetryDecision, RetryFault> {
        Ok(self(value))
    }
}

/// Deadline-aware retry classification.
///
/// Implementations may block to realize an inter-attempt delay, and may
/// fail with [`RetryFault::DeadlineExceeded`].
pub trait TimeoutRetryPredicate<T> {
    /// Decide whether `value` warrants another attempt before
    /// `deadline_nanos`.
    fn decide(&mut self, value: &T, deadline_nanos: i64) -> Result<RetryDecision, RetryFault>;
}

impl<T, P> TimeoutRetryPredicate<T> for &mut P
where
    P: TimeoutRetryPredicate<T>,
{
    fn decide(&mut self, value: &T, deadline_nanos: i64) -> Result<RetryDecision, RetryFault> {
        (**self).decide(value, deadline_nanos)
    }
}

/// Classification with backoff granularity.
pub trait AdvancedRetryPredicate<T> {
    /// Classify `value`.
    fn decide(&mut self, value: &T) -> AdvancedDecision;

    /// Classify with the deadline available; defaults to the plain form.
    fn decide_with_deadline(&mut self, value: &T, deadline_nanos: i64) -> AdvancedDecision {
        let _ = deadline_nanos;
        self.decide(value)
    }
}

impl<T, F> AdvancedRetryPredicate<T> for F
where
    F: FnMut(&T) -> AdvancedDecision,
{
    fn decide(&mut self, value: &T) -> AdvancedDecision {
        self(value)
    }
}

/// The compact form: a signed millisecond delay.
///
/// Negative means abort, zero means retry immediately, positive means
/// sleep that long and retry.
pub trait TimeoutDelayPredicate<T> {
    /// The delay before the next attempt, in signed millis.
    fn delay_millis(&mut self, value: &T, deadline_nanos: i64) -> i64;
}

/// Always abort. Implements every predicate shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl<T> RetryPredicate<T> for NoRetry {
    fn decide(&mut self, _value: &T) -> Result<RetryDecision, RetryFault> {
        Ok(RetryDecision::Abort)
    }
}

impl<T> TimeoutRetryPredicate<T> for NoRetry {
    fn decide(&mut self, _value: &T, _deadline_nanos: i64) -> Result<RetryDecision, RetryFault> {
        Ok(RetryDecision::Abort)
    }
}

impl<T> AdvancedRetryPredicate<T> for NoRetry {
    fn decide(&mut self, _value: &T) -> AdvancedDecision {
        AdvancedDecision::Abort
    }
}

impl<T> TimeoutDelayPredicate<T> for NoRetry {
    fn delay_millis(&mut self, _value: &T, _deadline_nanos: i64) -> i64 {
        -1
    }
}

/// Retry while the produced value is `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryForNone;

impl<T> RetryPredicate<Option<T>> for RetryForNone {
    fn decide(&mut self, value: &Option<T>) -> Result<RetryDecision, RetryFault> {
        Ok(match value {
            None => RetryDecision::Retry,
            Some(_) => RetryDecision::Abort,
        })
    }
}

impl<T> TimeoutRetryPredicate<Option<T>> for RetryForNone {
    fn decide(
        &mut self,
        value: &Option<T>,
        _deadline_nanos: i64,
    ) -> Result<RetryDecision, RetryFault> {
        RetryPredicate::decide(self, value)
    }
}

fn is_transient_cause(error: &(dyn Error + 'static)) -> bool {
    if error.is::<DeadlineExceeded>() {
        return true;
    }
    error.downcast_ref::<std::io::Error>().is_some_and(|io| {
        matches!(
            io.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::NotConnected
        )
    })
}

/// A decent default failure classifier.
///
/// Walks the cause chain and retries when any cause is a transient
/// transport or timeout failure; everything else aborts. It can retry
/// failures that are not actually transient (an io error raised by a
/// parser, say), so operations with sharper knowledge should bring their
/// own classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorRetry;

impl DefaultErrorRetry {
    /// Boolean projection of the classification.
    pub fn should_retry<E: Error + 'static>(error: &E) -> bool {
        first_cause(error, is_transient_cause).is_some()
    }
}

impl<E: Error + 'static> AdvancedRetryPredicate<E> for DefaultErrorRetry {
    fn decide(&mut self, error: &E) -> AdvancedDecision {
        if Self::should_retry(error) {
            tracing::debug!(error = %error, "transient failure, retrying");
            AdvancedDecision::Retry
        } else {
            AdvancedDecision::Abort
        }
    }
}

/// Projects a [`TimeoutDelayPredicate`] into a [`TimeoutRetryPredicate`]
/// by sleeping out the requested delay (interruptibly).
#[derive(Debug)]
pub struct DelayedRetry<P> {
    inner: P,
}

impl<P> DelayedRetry<P> {
    /// Wrap `inner`.
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<T, P> TimeoutRetryPredicate<T> for DelayedRetry<P>
where
    P: TimeoutDelayPredicate<T>,
{
    fn decide(&mut self, value: &T, deadline_nanos: i64) -> Result<RetryDecision, RetryFault> {
        let delay = self.inner.delay_millis(value, deadline_nanos);
        if delay < 0 {
            return Ok(RetryDecision::Abort);
        }
        if delay > 0 {
            interrupt::sleep(Duration::from_millis(delay as u64))?;
        }
        Ok(RetryDecision::Retry)
    }
}

/// Binds a fixed deadline to project a [`TimeoutRetryPredicate`] into a
/// deadline-free [`RetryPredicate`].
#[derive(Debug)]
pub struct DeadlineBound<P> {
    deadline_nanos: i64,
    inner: P,
}

impl<P> DeadlineBound<P> {
    /// Bind `inner` to `deadline_nanos`.
    pub fn new(deadline_nanos: i64, inner: P) -> Self {
        Self {
            deadline_nanos,
            inner,
        }
    }

    /// The bound deadline.
    pub fn deadline_nanos(&self) -> i64 {
        self.deadline_nanos
    }
}

impl<T, P> RetryPredicate<T> for DeadlineBound<P>
where
    P: TimeoutRetryPredicate<T>,
{
    fn decide(&mut self, value: &T) -> Result<RetryDecision, RetryFault> {
        self.inner.decide(value, self.deadline_nanos)
    }
}
