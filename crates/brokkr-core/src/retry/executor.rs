//! The retry driver
//!
//! A synchronous, blocking loop: invoke the operation, let a predicate
//! classify the outcome, sleep if the predicate says so, and go again.
//! Interruption is never retried and always propagates with the worker's
//! flag restored. The driver holds no state across invocations and never
//! consults the ambient execution context; deadlines reach it only through
//! predicates that close over the deadline they enforce.

use std::error::Error;
use std::time::Duration;

use crate::interrupt::{self, Interrupted};
use crate::time;

use super::backoff::{default_failure_class, FibonacciPolicy, FibonacciRetryPredicate};
use super::error::{ErrorChain, RetryError};
use super::predicates::{
    AdvancedRetryPredicate, DeadlineBound, DefaultErrorRetry, NoRetry, RetryDecision, RetryFault,
    RetryPredicate, TimeoutRetryPredicate,
};

/// Outcome of a single attempt that did not produce a value.
#[derive(Debug)]
pub enum CallError<E> {
    /// The operation failed with its domain error.
    Error(E),
    /// The operation observed the worker's interruption flag.
    Interrupted(Interrupted),
}

impl<E> From<Interrupted> for CallError<E> {
    fn from(value: Interrupted) -> Self {
        CallError::Interrupted(value)
    }
}

/// An operation the driver may invoke repeatedly.
///
/// The hooks run once, after the loop has decided to stop: `last_return`
/// may transform the final value, `last_error` may transform the failure
/// chain or swallow it by supplying a substitute value.
pub trait RetryCallable<T, E> {
    /// One attempt.
    fn call(&mut self) -> Result<T, CallError<E>>;

    /// Final-value hook.
    fn last_return(&mut self, value: T) -> T {
        value
    }

    /// Terminal-failure hook. Returning `Ok` swallows the failure.
    fn last_error(&mut self, failure: ErrorChain<E>) -> Result<T, ErrorChain<E>> {
        Err(failure)
    }
}

impl<T, E, F> RetryCallable<T, E> for F
where
    F: FnMut() -> Result<T, CallError<E>>,
{
    fn call(&mut self) -> Result<T, CallError<E>> {
        self()
    }
}

/// Adapt a plain fallible closure into the [`RetryCallable`] shape.
pub fn fallible<T, E, F>(mut op: F) -> impl FnMut() -> Result<T, CallError<E>>
where
    F: FnMut() -> Result<T, E>,
{
    move || op().map_err(CallError::Error)
}

fn chain_onto<E>(chain: Option<ErrorChain<E>>, error: E) -> ErrorChain<E> {
    match chain {
        Some(chain) => chain.chain(error),
        None => ErrorChain::new(error),
    }
}

fn interrupted<T, E>() -> Result<T, RetryError<E>> {
    interrupt::set_interrupted();
    Err(RetryError::Interrupted(Interrupted))
}

/// Run `op` until it succeeds, a predicate aborts, or the worker is
/// interrupted.
///
/// Failed attempts accumulate in an [`ErrorChain`]: the failure handed
/// back after `n` attempts is the latest one carrying the `n - 1` earlier
/// ones as suppressed siblings. Every call starts from a fresh state.
pub fn execute_with_retry<T, E, C, RP, EP>(
    mut op: C,
    mut retry_on_result: RP,
    mut retry_on_error: EP,
) -> Result<T, RetryError<E>>
where
    E: Error,
    C: RetryCallable<T, E>,
    RP: RetryPredicate<T>,
    EP: RetryPredicate<E>,
{
    let mut chain: Option<ErrorChain<E>> = None;
    let mut attempts: u32 = 0;
    loop {
        if attempts > 0 && interrupt::take_interrupted() {
            return interrupted();
        }
        attempts += 1;
        match op.call() {
            Ok(value) => match retry_on_result.decide(&value) {
                Ok(RetryDecision::Abort) => {
                    if attempts > 1 {
                        tracing::info!(attempts, "operation succeeded after retry");
                    }
                    return Ok(op.last_return(value));
                }
                Ok(RetryDecision::Retry) => {
                    tracing::debug!(attempts, "result rejected, retrying");
                }
                Err(RetryFault::Interrupted(_)) => return interrupted(),
                Err(RetryFault::DeadlineExceeded(source)) => {
                    return Err(RetryError::DeadlineExceeded {
                        source,
                        failures: chain.take(),
                    })
                }
            },
            Err(CallError::Interrupted(_)) => return interrupted(),
            Err(CallError::Error(error)) => match retry_on_error.decide(&error) {
                Ok(RetryDecision::Abort) => {
                    let failure = chain_onto(chain.take(), error);
                    return match op.last_error(failure) {
                        Ok(value) => Ok(value),
                        Err(failure) => {
                            tracing::error!(attempts, error = %failure, "retry aborted");
                            Err(RetryError::Aborted {
                                attempts,
                                source: failure,
                            })
                        }
                    };
                }
                Ok(RetryDecision::Retry) => {
                    tracing::warn!(attempts, error = %error, "attempt failed, will retry");
                    chain = Some(chain_onto(chain.take(), error));
                }
                Err(RetryFault::Interrupted(_)) => return interrupted(),
                Err(RetryFault::DeadlineExceeded(source)) => {
                    return Err(RetryError::DeadlineExceeded {
                        source,
                        failures: Some(chain_onto(chain.take(), error)),
                    })
                }
            },
        }
    }
}

/// An operation whose deadline is fixed at construction time.
///
/// The deadline is exposed so predicates can close over the same one the
/// operation sees.
pub struct TimeoutCallable<F> {
    deadline_nanos: i64,
    op: F,
}

impl<F> TimeoutCallable<F> {
    /// Deadline `timeout` from now.
    pub fn new(timeout: Duration, op: F) -> Self {
        Self {
            deadline_nanos: time::deadline_nanos(timeout),
            op,
        }
    }

    /// Explicit absolute deadline.
    pub fn with_deadline(deadline_nanos: i64, op: F) -> Self {
        Self { deadline_nanos, op }
    }

    /// The deadline every attempt runs under.
    pub fn deadline_nanos(&self) -> i64 {
        self.deadline_nanos
    }
}

impl<T, E, F> RetryCallable<T, E> for TimeoutCallable<F>
where
    F: FnMut(i64) -> Result<T, CallError<E>>,
{
    fn call(&mut self) -> Result<T, CallError<E>> {
        (self.op)(self.deadline_nanos)
    }
}

/// Run a deadlined operation with deadline-aware predicates.
///
/// Both predicates are bound to the operation's own deadline.
pub fn execute_with_timeout_retry<T, E, F, RP, EP>(
    what: TimeoutCallable<F>,
    retry_on_result: RP,
    retry_on_error: EP,
) -> Result<T, RetryError<E>>
where
    E: Error,
    F: FnMut(i64) -> Result<T, CallError<E>>,
    RP: TimeoutRetryPredicate<T>,
    EP: TimeoutRetryPredicate<E>,
{
    let deadline_nanos = what.deadline_nanos();
    execute_with_retry(
        what,
        DeadlineBound::new(deadline_nanos, retry_on_result),
        DeadlineBound::new(deadline_nanos, retry_on_error),
    )
}

/// Run a deadlined operation with a caller-supplied failure classifier
/// driving randomized Fibonacci backoff.
///
/// After the immediate retries are spent, delays follow randomized
/// Fibonacci values seeded at a hundredth of `max_delay_millis`.
pub fn execute_with_classified_retry<T, E, F, P>(
    what: TimeoutCallable<F>,
    nr_immediate_retries: u32,
    max_delay_millis: u64,
    classifier: P,
) -> Result<T, RetryError<E>>
where
    E: Error + 'static,
    F: FnMut(i64) -> Result<T, CallError<E>>,
    P: AdvancedRetryPredicate<E>,
{
    let policy = FibonacciPolicy::with_max_delay(nr_immediate_retries, max_delay_millis);
    let backoff = FibonacciRetryPredicate::new(classifier, policy, default_failure_class::<E>);
    execute_with_timeout_retry(what, NoRetry, backoff)
}

/// Run a deadlined operation with the default transient-failure
/// classifier and randomized Fibonacci backoff.
pub fn execute_with_backoff_retry<T, E, F>(
    what: TimeoutCallable<F>,
    nr_immediate_retries: u32,
    max_delay_millis: u64,
) -> Result<T, RetryError<E>>
where
    E: Error + 'static,
    F: FnMut(i64) -> Result<T, CallError<E>>,
{
    execute_with_classified_retry(what, nr_immediate_retries, max_delay_millis, DefaultErrorRetry)
}
