//! Backoff strategies and the per-failure-class retry register
//!
//! The flagship strategy is Fibonacci growth with randomization, keyed
//! per failure class: each distinct root cause gets its own register of
//! immediate retries and Fibonacci state, so a flapping connection does
//! not eat the budget of an unrelated slow query.

use std::collections::HashMap;
use std::error::Error;
use std::hash::Hash;
use std::io;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::causes::root_cause;
use crate::interrupt;
use crate::time::{self, DeadlineExceeded};

use super::predicates::{
    AdvancedDecision, AdvancedRetryPredicate, RetryDecision, RetryFault, TimeoutRetryPredicate,
};

/// A source of inter-attempt delays.
pub trait BackoffDelay {
    /// The next delay, in millis.
    fn next_delay_millis(&mut self) -> u64;
}

/// Per-failure-class register: a burst of zero-delay retries, then
/// Fibonacci growth capped at `max_delay_millis`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibonacciDelay {
    immediate_left: u32,
    p1: u64,
    p2: u64,
    max_delay_millis: u64,
}

impl FibonacciDelay {
    /// Seed the register. A `min_delay_millis` below 1 degenerates to the
    /// 0/1 Fibonacci seed.
    pub fn new(immediate_retries: u32, min_delay_millis: u64, max_delay_millis: u64) -> Self {
        let (p1, p2) = if min_delay_millis < 1 {
            (0, 1)
        } else {
            (min_delay_millis, min_delay_millis)
        };
        Self {
            immediate_left: immediate_retries,
            p1,
            p2,
            max_delay_millis,
        }
    }

    /// Zero-delay retries still available.
    pub fn immediate_left(&self) -> u32 {
        self.immediate_left
    }
}

impl BackoffDelay for FibonacciDelay {
    fn next_delay_millis(&mut self) -> u64 {
        if self.immediate_left > 0 {
            self.immediate_left -= 1;
            0
        } else if self.p2 > self.max_delay_millis {
            self.max_delay_millis
        } else {
            let result = self.p2;
            self.p2 = self.p1.saturating_add(self.p2);
            self.p1 = result;
            result
        }
    }
}

/// Wraps any [`BackoffDelay`] and draws `uniform[0, inner.next)`.
#[derive(Debug)]
pub struct RandomizedBackoff<B> {
    inner: B,
    rng: SmallRng,
}

impl<B> RandomizedBackoff<B> {
    /// Wrap `inner` with an OS-seeded generator.
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            rng: SmallRng::from_os_rng(),
        }
    }

    /// Wrap `inner` with a fixed seed, for reproducible tests.
    pub fn with_seed(inner: B, seed: u64) -> Self {
        Self {
            inner,
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl<B: BackoffDelay> BackoffDelay for RandomizedBackoff<B> {
    fn next_delay_millis(&mut self) -> u64 {
        let next = self.inner.next_delay_millis();
        if next == 0 {
            0
        } else {
            self.rng.random_range(0..next)
        }
    }
}

/// The class a failure is filed under in the retry register.
///
/// Derived from the root cause so wrapper errors collapse onto their
/// innermost failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Root cause was an io error of this kind.
    Io(io::ErrorKind),
    /// Root cause was an exhausted deadline.
    Deadline,
    /// Any other root cause.
    Other,
}

/// File `error` under its root cause's class.
pub fn default_failure_class<E: Error + 'static>(error: &E) -> FailureClass {
    let root = root_cause(error);
    if let Some(io) = root.downcast_ref::<io::Error>() {
        FailureClass::Io(io.kind())
    } else if root.is::<DeadlineExceeded>() {
        FailureClass::Deadline
    } else {
        FailureClass::Other
    }
}

fn default_nr_immediate_retries() -> u32 {
    3
}
fn default_min_delay() -> u64 {
    10
}
fn default_max_delay() -> u64 {
    30000
}

/// Tuning for the Fibonacci backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FibonacciPolicy {
    /// Zero-delay retries granted to each new failure class.
    #[serde(default = "default_nr_immediate_retries")]
    pub nr_immediate_retries: u32,

    /// Seed of the Fibonacci sequence, in millis.
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,

    /// Saturation cap, in millis.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for FibonacciPolicy {
    fn default() -> Self {
        Self {
            nr_immediate_retries: default_nr_immediate_retries(),
            min_delay_ms: default_min_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl FibonacciPolicy {
    /// Policy seeded at a hundredth of the cap.
    pub fn with_max_delay(nr_immediate_retries: u32, max_delay_ms: u64) -> Self {
        Self {
            nr_immediate_retries,
            min_delay_ms: max_delay_ms / 100,
            max_delay_ms,
        }
    }
}

/// Fibonacci backoff with randomization, keyed per failure class.
///
/// Wraps an [`AdvancedRetryPredicate`] classifier. Each failure class gets
/// a lazily created [`FibonacciDelay`] register; the actual sleep is a
/// uniform draw below the register's next value, capped by the remaining
/// deadline budget. A class first seen through
/// [`AdvancedDecision::RetryDelayed`] starts with no immediate retries.
#[derive(Debug)]
pub struct FibonacciRetryPredicate<P, M, K> {
    classifier: P,
    policy: FibonacciPolicy,
    register: HashMap<K, FibonacciDelay>,
    mapper: M,
    rng: SmallRng,
}

impl<P, M, K> FibonacciRetryPredicate<P, M, K>
where
    K: Eq + Hash,
{
    /// Build with an OS-seeded jitter generator.
    pub fn new(classifier: P, policy: FibonacciPolicy, mapper: M) -> Self {
        Self {
            classifier,
            policy,
            register: HashMap::new(),
            mapper,
            rng: SmallRng::from_os_rng(),
        }
    }

    /// Build with a fixed jitter seed, for reproducible tests.
    pub fn with_seed(classifier: P, policy: FibonacciPolicy, mapper: M, seed: u64) -> Self {
        Self {
            classifier,
            policy,
            register: HashMap::new(),
            mapper,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Inspect the register for one failure class.
    pub fn retry_data(&self, key: &K) -> Option<&FibonacciDelay> {
        self.register.get(key)
    }
}

impl<T, P, M, K> TimeoutRetryPredicate<T> for FibonacciRetryPredicate<P, M, K>
where
    P: AdvancedRetryPredicate<T>,
    M: Fn(&T) -> K,
    K: Eq + Hash,
{
    fn decide(&mut self, value: &T, deadline_nanos: i64) -> Result<RetryDecision, RetryFault> {
        let now = time::now_nanos();
        let remaining_nanos = deadline_nanos.saturating_sub(now);
        if remaining_nanos <= 0 {
            return Ok(RetryDecision::Abort);
        }
        match self.classifier.decide_with_deadline(value, deadline_nanos) {
            AdvancedDecision::Abort => Ok(RetryDecision::Abort),
            AdvancedDecision::RetryImmediate => Ok(RetryDecision::Retry),
            action => {
                let key = (self.mapper)(value);
                let policy = self.policy;
                let register = self.register.entry(key).or_insert_with(|| {
                    if action == AdvancedDecision::RetryDelayed {
                        FibonacciDelay::new(0, policy.min_delay_ms, policy.max_delay_ms)
                    } else {
                        FibonacciDelay::new(
                            policy.nr_immediate_retries,
                            policy.min_delay_ms,
                            policy.max_delay_ms,
                        )
                    }
                });
                let next = register.next_delay_millis();
                let cap = (remaining_nanos / 1_000_000) as u64;
                let delay = next.min(cap);
                if delay > 0 {
                    let jittered = self.rng.random_range(0..delay);
                    interrupt::sleep(Duration::from_millis(jittered))?;
                }
                Ok(RetryDecision::Retry)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::predicates::NoRetry;

    #[test]
    fn fibonacci_sequence_grows_and_saturates() {
        let mut delay = FibonacciDelay::new(0, 1, 100);
        let drawn: Vec<u64> = (0..10).map(|_| delay.next_delay_millis()).collect();
        assert_eq!(drawn, vec![1, 2, 3, 5, 8, 13, 21, 34, 55, 89]);
        // 144 > 100: capped from here on, without advancing.
        assert_eq!(delay.next_delay_millis(), 100);
        assert_eq!(delay.next_delay_millis(), 100);
    }

    #[test]
    fn immediate_retries_come_first_and_are_zero() {
        let mut delay = FibonacciDelay::new(3, 10, 1000);
        assert_eq!(delay.next_delay_millis(), 0);
        assert_eq!(delay.next_delay_millis(), 0);
        assert_eq!(delay.next_delay_millis(), 0);
        assert_eq!(delay.immediate_left(), 0);
        assert_eq!(delay.next_delay_millis(), 10);
        assert_eq!(delay.next_delay_millis(), 20);
        assert_eq!(delay.next_delay_millis(), 30);
    }

    #[test]
    fn degenerate_seed_starts_at_one() {
        let mut delay = FibonacciDelay::new(0, 0, 50);
        assert_eq!(delay.next_delay_millis(), 1);
        assert_eq!(delay.next_delay_millis(), 1);
        assert_eq!(delay.next_delay_millis(), 2);
        assert_eq!(delay.next_delay_millis(), 3);
    }

    #[test]
    fn delays_never_exceed_the_cap() {
        let mut delay = FibonacciDelay::new(2, 7, 40);
        for _ in 0..50 {
            assert!(delay.next_delay_millis() <= 40);
        }
    }

    #[test]
    fn randomized_backoff_stays_below_the_inner_delay() {
        struct Fixed(u64);
        impl BackoffDelay for Fixed {
            fn next_delay_millis(&mut self) -> u64 {
                self.0
            }
        }

        let mut randomized = RandomizedBackoff::with_seed(Fixed(100), 7);
        for _ in 0..200 {
            assert!(randomized.next_delay_millis() < 100);
        }

        let mut zero = RandomizedBackoff::with_seed(Fixed(0), 7);
        assert_eq!(zero.next_delay_millis(), 0);
    }

    #[test]
    fn randomized_backoff_is_reproducible_with_a_seed() {
        struct Fixed(u64);
        impl BackoffDelay for Fixed {
            fn next_delay_millis(&mut self) -> u64 {
                self.0
            }
        }

        let draws = |seed| {
            let mut b = RandomizedBackoff::with_seed(Fixed(1000), seed);
            (0..10).map(|_| b.next_delay_millis()).collect::<Vec<_>>()
        };
        assert_eq!(draws(42), draws(42));
    }

    #[test]
    fn failure_class_collapses_wrappers_to_the_root_cause() {
        #[derive(Debug)]
        struct Wrapper(io::Error);
        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "wrapped: {}", self.0)
            }
        }
        impl Error for Wrapper {
            fn source(&self) -> Option<&(dyn Error + 'static)> {
                Some(&self.0)
            }
        }

        let wrapped = Wrapper(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(
            default_failure_class(&wrapped),
            FailureClass::Io(io::ErrorKind::TimedOut)
        );

        let deadline = DeadlineExceeded {
            deadline_nanos: 0,
            observed_nanos: 1,
        };
        assert_eq!(default_failure_class(&deadline), FailureClass::Deadline);

        assert_eq!(default_failure_class(&std::fmt::Error), FailureClass::Other);
    }

    #[test]
    fn predicate_aborts_once_the_deadline_is_spent() {
        let mut predicate = FibonacciRetryPredicate::with_seed(
            DefaultAlwaysRetry,
            FibonacciPolicy::default(),
            |_: &io::Error| FailureClass::Other,
            1,
        );
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let past = time::now_nanos() - 1;
        assert_eq!(
            predicate.decide(&err, past).unwrap(),
            RetryDecision::Abort
        );
    }

    #[test]
    fn immediate_budget_is_consumed_per_class() {
        let mut predicate = FibonacciRetryPredicate::with_seed(
            DefaultAlwaysRetry,
            FibonacciPolicy {
                nr_immediate_retries: 1,
                min_delay_ms: 1,
                max_delay_ms: 5,
            },
            default_failure_class::<io::Error>,
            9,
        );
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let deadline = time::now_nanos() + 1_000_000_000;

        assert_eq!(
            predicate.decide(&reset, deadline).unwrap(),
            RetryDecision::Retry
        );
        let data = predicate
            .retry_data(&FailureClass::Io(io::ErrorKind::ConnectionReset))
            .unwrap();
        assert_eq!(data.immediate_left(), 0);

        // A different class still has its own immediate budget.
        assert!(predicate
            .retry_data(&FailureClass::Io(io::ErrorKind::TimedOut))
            .is_none());
    }

    #[test]
    fn retry_delayed_skips_the_immediate_budget() {
        struct AlwaysDelayed;
        impl<T> AdvancedRetryPredicate<T> for AlwaysDelayed {
            fn decide(&mut self, _value: &T) -> AdvancedDecision {
                AdvancedDecision::RetryDelayed
            }
        }

        let mut predicate = FibonacciRetryPredicate::with_seed(
            AlwaysDelayed,
            FibonacciPolicy {
                nr_immediate_retries: 5,
                min_delay_ms: 1,
                max_delay_ms: 2,
            },
            |_: &io::Error| FailureClass::Other,
            3,
        );
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let deadline = time::now_nanos() + 1_000_000_000;
        assert_eq!(
            predicate.decide(&err, deadline).unwrap(),
            RetryDecision::Retry
        );
        let data = predicate.retry_data(&FailureClass::Other).unwrap();
        assert_eq!(data.immediate_left(), 0);
    }

    #[test]
    fn retry_immediate_bypasses_the_register() {
        struct AlwaysImmediate;
        impl<T> AdvancedRetryPredicate<T> for AlwaysImmediate {
            fn decide(&mut self, _value: &T) -> AdvancedDecision {
                AdvancedDecision::RetryImmediate
            }
        }

        let mut predicate = FibonacciRetryPredicate::with_seed(
            AlwaysImmediate,
            FibonacciPolicy::default(),
            |_: &io::Error| FailureClass::Other,
            3,
        );
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let deadline = time::now_nanos() + 1_000_000_000;
        assert_eq!(
            predicate.decide(&err, deadline).unwrap(),
            RetryDecision::Retry
        );
        assert!(predicate.retry_data(&FailureClass::Other).is_none());
    }

    #[test]
    fn abort_classification_wins_over_backoff() {
        let mut predicate = FibonacciRetryPredicate::with_seed(
            NoRetry,
            FibonacciPolicy::default(),
            |_: &io::Error| FailureClass::Other,
            3,
        );
        let err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let deadline = time::now_nanos() + 1_000_000_000;
        assert_eq!(
            predicate.decide(&err, deadline).unwrap(),
            RetryDecision::Abort
        );
    }

    /// Classifier that always asks for the default retry policy.
    struct DefaultAlwaysRetry;
    impl<T> AdvancedRetryPredicate<T> for DefaultAlwaysRetry {
        fn decide(&mut self, _value: &T) -> AdvancedDecision {
            AdvancedDecision::Retry
        }
    }

    #[test]
    fn policy_with_max_delay_seeds_at_a_hundredth() {
        let policy = FibonacciPolicy::with_max_delay(2, 5000);
        assert_eq!(policy.nr_immediate_retries, 2);
        assert_eq!(policy.min_delay_ms, 50);
        assert_eq!(policy.max_delay_ms, 5000);
    }
}
