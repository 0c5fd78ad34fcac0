//! Execution-context construction
//!
//! Contexts are built by a process-wide factory chosen once from
//! configuration. A decorator can be layered on top of the factory so
//! orthogonal concerns (tracing export, counters) interpose without any
//! call site changing. Factories are selected by registry name; there is
//! no dynamic loading.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::{config, FactoryKind, FactoryWrapperKind};

use super::{ExecutionContext, Relation};

/// Constructs execution contexts.
///
/// Implementations must be cheap: every operation boundary goes through
/// here.
pub trait ExecutionContextFactory: Send + Sync {
    /// Build a context. The deadline is clamped to the parent's during
    /// construction, so implementations only forward what they are given.
    fn start(
        &self,
        name: &str,
        id: Option<String>,
        parent: Option<Arc<ExecutionContext>>,
        relation: Relation,
        start_time_nanos: i64,
        deadline_nanos: i64,
    ) -> Arc<ExecutionContext>;
}

impl<T: ExecutionContextFactory + ?Sized> ExecutionContextFactory for Box<T> {
    fn start(
        &self,
        name: &str,
        id: Option<String>,
        parent: Option<Arc<ExecutionContext>>,
        relation: Relation,
        start_time_nanos: i64,
        deadline_nanos: i64,
    ) -> Arc<ExecutionContext> {
        (**self).start(name, id, parent, relation, start_time_nanos, deadline_nanos)
    }
}

/// The default factory: plain construction, no side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicContextFactory;

impl ExecutionContextFactory for BasicContextFactory {
    fn start(
        &self,
        name: &str,
        id: Option<String>,
        parent: Option<Arc<ExecutionContext>>,
        relation: Relation,
        start_time_nanos: i64,
        deadline_nanos: i64,
    ) -> Arc<ExecutionContext> {
        ExecutionContext::create(name, id, parent, relation, start_time_nanos, deadline_nanos)
    }
}

/// Decorator that emits a tracing event and counts every context started.
#[derive(Debug, Default)]
pub struct LoggingContextFactory<F> {
    inner: F,
    started: AtomicU64,
}

impl<F: ExecutionContextFactory> LoggingContextFactory<F> {
    /// Wrap `inner`.
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            started: AtomicU64::new(0),
        }
    }

    /// How many contexts this factory has started.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

impl<F: ExecutionContextFactory> ExecutionContextFactory for LoggingContextFactory<F> {
    fn start(
        &self,
        name: &str,
        id: Option<String>,
        parent: Option<Arc<ExecutionContext>>,
        relation: Relation,
        start_time_nanos: i64,
        deadline_nanos: i64,
    ) -> Arc<ExecutionContext> {
        let ctx = self
            .inner
            .start(name, id, parent, relation, start_time_nanos, deadline_nanos);
        self.started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            name = %ctx.name(),
            parent = ?ctx.parent().map(|p| p.name()),
            deadline_nanos = ctx.deadline_nanos(),
            "execution context started"
        );
        ctx
    }
}

enum InstalledFactory {
    Basic(BasicContextFactory),
    Logging(LoggingContextFactory<BasicContextFactory>),
}

impl InstalledFactory {
    fn as_dyn(&self) -> &(dyn ExecutionContextFactory + 'static) {
        match self {
            InstalledFactory::Basic(f) => f,
            InstalledFactory::Logging(f) => f,
        }
    }
}

/// The factory selected by configuration, resolved once.
pub fn context_factory() -> &'static dyn ExecutionContextFactory {
    static FACTORY: OnceLock<InstalledFactory> = OnceLock::new();
    FACTORY
        .get_or_init(|| {
            let base = match config().factory {
                FactoryKind::Basic => BasicContextFactory,
            };
            match config().factory_wrapper {
                Some(FactoryWrapperKind::Logging) => {
                    InstalledFactory::Logging(LoggingContextFactory::new(base))
                }
                None => InstalledFactory::Basic(base),
            }
        })
        .as_dyn()
}
