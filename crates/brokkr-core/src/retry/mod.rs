//! Blocking retry execution with pluggable backoff
//!
//! The driver repeatedly invokes an operation until it succeeds, a
//! predicate aborts, or the worker is interrupted. Transient failures
//! feed a per-failure-class backoff register that schedules the next
//! delay; every failure an attempt produced survives in the terminal
//! error as a suppressed sibling.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use brokkr_core::retry::{execute_with_backoff_retry, CallError, TimeoutCallable};
//!
//! fn fetch(deadline_nanos: i64) -> Result<String, CallError<std::io::Error>> {
//!     // Talk to something flaky, watching the deadline.
//!     Ok("payload".to_string())
//! }
//!
//! let what = TimeoutCallable::new(Duration::from_secs(5), fetch);
//! let payload = execute_with_backoff_retry(what, 2, 1000);
//! ```

mod backoff;
mod error;
mod executor;
mod predicates;

pub use backoff::{
    default_failure_class, BackoffDelay, FailureClass, FibonacciDelay, FibonacciPolicy,
    FibonacciRetryPredicate, RandomizedBackoff,
};
pub use error::{ErrorChain, RetryError};
pub use executor::{
    execute_with_backoff_retry, execute_with_classified_retry, execute_with_retry,
    execute_with_timeout_retry, fallible, CallError, RetryCallable, TimeoutCallable,
};
pub use predicates::{
    AdvancedDecision, AdvancedRetryPredicate, DeadlineBound, DefaultErrorRetry, DelayedRetry,
    NoRetry, RetryDecision, RetryFault, RetryForNone, RetryPredicate, TimeoutDelayPredicate,
    TimeoutRetryPredicate,
};
