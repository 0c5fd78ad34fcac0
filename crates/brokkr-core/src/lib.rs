//! # brokkr-core
//!
//! Concurrency substrate shared by the Brokkr libraries:
//! - Deadline-scoped execution contexts propagated across threads and
//!   task submissions (`context`)
//! - A blocking retry engine with pluggable, per-failure-class backoff
//!   (`retry`)
//! - The supporting pieces both lean on: a monotonic time source,
//!   compact unique ids, per-worker interruption, and cause-chain
//!   inspection

pub mod causes;
pub mod config;
pub mod context;
pub mod error;
pub mod interrupt;
pub mod retry;
pub mod time;
pub mod uid;

pub use config::Config;
pub use context::{current, start, ContextBuilder, ContextScope, ExecutionContext, Relation};
pub use error::{Error, Result};
pub use retry::{execute_with_retry, ErrorChain, RetryError};
