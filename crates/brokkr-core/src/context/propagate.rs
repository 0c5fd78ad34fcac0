//! Context propagation across threads
//!
//! A wrapper captures a context reference at construction time; when the
//! wrapped operation later runs, possibly on another thread, the wrapper
//! opens a child context there, runs the operation inside its scope, and
//! closes it on every exit path. An already-expired captured context does
//! not suppress execution: the child is simply born expired and the
//! operation's own deadline checks cut it short.

use std::sync::Arc;

use super::{ContextBuilder, ExecutionContext};

fn open_child(name: &str, parent: &Arc<ExecutionContext>) -> super::ContextScope {
    ContextBuilder::new(name).parent(parent).start()
}

/// A fallible operation that re-establishes a captured context when run.
///
/// With no captured context the operation runs untouched.
pub struct PropagatingCallable<F> {
    name: String,
    context: Option<Arc<ExecutionContext>>,
    op: F,
}

impl<F> PropagatingCallable<F> {
    /// Wrap `op`, capturing `context` for the eventual invocation.
    pub fn new(name: impl Into<String>, context: Option<Arc<ExecutionContext>>, op: F) -> Self {
        Self {
            name: name.into(),
            context,
            op,
        }
    }

    /// The captured context, if any.
    pub fn context(&self) -> Option<&Arc<ExecutionContext>> {
        self.context.as_ref()
    }

    /// Run the operation inside a child of the captured context.
    pub fn call<T, E>(self) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        match &self.context {
            None => (self.op)(),
            Some(parent) => {
                let _scope = open_child(&self.name, parent);
                (self.op)()
            }
        }
    }
}

/// A [`PropagatingCallable`] whose child context gets its own deadline,
/// still tightened by the captured parent's.
pub struct DeadlinedPropagatingCallable<F> {
    name: String,
    context: Arc<ExecutionContext>,
    deadline_nanos: i64,
    op: F,
}

impl<F> DeadlinedPropagatingCallable<F> {
    /// Wrap `op` with an overriding absolute deadline.
    pub fn new(
        name: impl Into<String>,
        context: &Arc<ExecutionContext>,
        deadline_nanos: i64,
        op: F,
    ) -> Self {
        Self {
            name: name.into(),
            context: Arc::clone(context),
            deadline_nanos,
            op,
        }
    }

    /// The deadline the child context will carry (before parent clamping).
    pub fn deadline_nanos(&self) -> i64 {
        self.deadline_nanos
    }

    /// Run the operation inside the deadlined child context.
    pub fn call<T, E>(self) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let _scope = ContextBuilder::new(self.name)
            .parent(&self.context)
            .deadline_nanos(self.deadline_nanos)
            .start();
        (self.op)()
    }
}

/// An infallible operation that re-establishes a captured context when run.
pub struct PropagatingRunnable<F> {
    name: String,
    context: Option<Arc<ExecutionContext>>,
    op: F,
}

impl<F> PropagatingRunnable<F> {
    /// Wrap `op`, capturing `context` for the eventual invocation.
    pub fn new(name: impl Into<String>, context: Option<Arc<ExecutionContext>>, op: F) -> Self {
        Self {
            name: name.into(),
            context,
            op,
        }
    }

    /// Run the operation inside a child of the captured context.
    pub fn run(self)
    where
        F: FnOnce(),
    {
        match &self.context {
            None => (self.op)(),
            Some(parent) => {
                let _scope = open_child(&self.name, parent);
                (self.op)()
            }
        }
    }
}

/// Wrap `op`, capturing the ambient context of the calling thread.
pub fn propagating_callable<F>(name: impl Into<String>, op: F) -> PropagatingCallable<F> {
    PropagatingCallable::new(name, super::current(), op)
}

/// Wrap every operation, capturing the ambient context once and sharing it.
///
/// The returned wrappers preserve the input order.
pub fn propagating_callables<F>(
    name: impl Into<String>,
    ops: Vec<F>,
) -> Vec<PropagatingCallable<F>> {
    let name = name.into();
    let context = super::current();
    ops.into_iter()
        .map(|op| PropagatingCallable::new(name.clone(), context.clone(), op))
        .collect()
}

/// Wrap `op` with an explicit context and deadline override.
pub fn deadlined_propagating_callable<F>(
    name: impl Into<String>,
    context: &Arc<ExecutionContext>,
    deadline_nanos: i64,
    op: F,
) -> DeadlinedPropagatingCallable<F> {
    DeadlinedPropagatingCallable::new(name, context, deadline_nanos, op)
}

/// Wrap every operation with a shared context and deadline override.
pub fn deadlined_propagating_callables<F>(
    name: impl Into<String>,
    context: &Arc<ExecutionContext>,
    deadline_nanos: i64,
    ops: Vec<F>,
) -> Vec<DeadlinedPropagatingCallable<F>> {
    let name = name.into();
    ops.into_iter()
        .map(|op| DeadlinedPropagatingCallable::new(name.clone(), context, deadline_nanos, op))
        .collect()
}

/// Wrap `op`, capturing the ambient context of the calling thread.
pub fn propagating_runnable<F>(name: impl Into<String>, op: F) -> PropagatingRunnable<F> {
    PropagatingRunnable::new(name, super::current(), op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{self, ContextBuilder};
    use crate::time;
    use std::convert::Infallible;
    use std::time::Duration;

    #[test]
    fn callable_reattaches_on_a_foreign_thread() {
        let parent = ContextBuilder::new("submit")
            .timeout(Duration::from_secs(30))
            .detached();
        let expected_deadline = parent.deadline_nanos();

        let wrapped = PropagatingCallable::new("worker-task", Some(Arc::clone(&parent)), || {
            let current = context::current().expect("child context attached");
            assert_eq!(current.name(), "worker-task");
            Ok::<_, Infallible>(current.deadline_nanos())
        });

        let observed = std::thread::scope(|scope| {
            scope.spawn(|| wrapped.call().unwrap()).join().unwrap()
        });
        assert_eq!(observed, expected_deadline);
        assert!(context::current().is_none());
    }

    #[test]
    fn callable_without_context_runs_untouched() {
        let wrapped = propagating_callable("bare", || {
            assert!(context::current().is_none());
            Ok::<_, Infallible>(7)
        });
        assert!(wrapped.context().is_none());
        assert_eq!(wrapped.call().unwrap(), 7);
    }

    #[test]
    fn child_scope_closes_even_when_the_operation_fails() {
        let parent = create_parent();
        let wrapped = PropagatingCallable::new("doomed", Some(Arc::clone(&parent)), || {
            Err::<(), &str>("boom")
        });
        assert_eq!(wrapped.call(), Err("boom"));
        assert!(context::current().is_none());
    }

    #[test]
    fn expired_parent_still_executes_the_operation() {
        let parent = ContextBuilder::new("spent")
            .deadline_nanos(time::now_nanos() - 1)
            .detached();
        assert!(parent.is_expired());

        let wrapped = PropagatingCallable::new("late", Some(Arc::clone(&parent)), || {
            let current = context::current().unwrap();
            assert!(current.is_expired());
            Ok::<_, Infallible>("ran anyway")
        });
        assert_eq!(wrapped.call().unwrap(), "ran anyway");
    }

    #[test]
    fn deadlined_callable_overrides_within_the_parent_budget() {
        let parent = ContextBuilder::new("parent")
            .timeout(Duration::from_secs(60))
            .detached();
        let override_deadline = time::now_nanos() + 1_000_000;

        let wrapped = DeadlinedPropagatingCallable::new(
            "bounded",
            &parent,
            override_deadline,
            || Ok::<_, Infallible>(context::current().unwrap().deadline_nanos()),
        );
        assert_eq!(wrapped.call().unwrap(), override_deadline);

        // An override beyond the parent is clamped back to it.
        let wrapped = DeadlinedPropagatingCallable::new("clamped", &parent, i64::MAX, || {
            Ok::<_, Infallible>(context::current().unwrap().deadline_nanos())
        });
        assert_eq!(wrapped.call().unwrap(), parent.deadline_nanos());
    }

    #[test]
    fn bulk_wrappers_share_the_context_and_keep_order() {
        let parent = create_parent();
        let scope = context::start_child("batch", &parent);
        let wrapped = propagating_callables(
            "batch-item",
            (0..5)
                .map(|i| move || Ok::<_, Infallible>(i))
                .collect::<Vec<_>>(),
        );
        scope.close().unwrap();

        assert_eq!(wrapped.len(), 5);
        for (i, w) in wrapped.into_iter().enumerate() {
            assert_eq!(w.call().unwrap(), i);
        }
    }

    #[test]
    fn runnable_propagates_like_a_callable() {
        let parent = create_parent();
        let observed = std::sync::Arc::new(std::sync::Mutex::new(None));
        let sink = std::sync::Arc::clone(&observed);
        let wrapped = PropagatingRunnable::new("fire-and-forget", Some(parent), move || {
            *sink.lock().unwrap() = Some(context::current().unwrap().name().to_string());
        });
        std::thread::scope(|scope| {
            scope.spawn(|| wrapped.run()).join().unwrap();
        });
        assert_eq!(observed.lock().unwrap().as_deref(), Some("fire-and-forget"));
    }

    fn create_parent() -> Arc<crate::context::ExecutionContext> {
        ContextBuilder::new("parent")
            .timeout(Duration::from_secs(10))
            .detached()
    }
}
