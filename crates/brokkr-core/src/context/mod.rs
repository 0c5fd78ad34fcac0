//! Deadline-scoped execution contexts
//!
//! An [`ExecutionContext`] is the per-operation record: a name, a lazily
//! generated id, an optional parent, and a hard monotonic deadline. A
//! context can be attached to the calling thread, where it becomes the
//! ambient [`current`] context that callees read without parameter
//! threading. Deadlines only ever tighten: a child's deadline never
//! exceeds its parent's.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! let scope = brokkr_core::context::ContextBuilder::new("ingest")
//!     .timeout(Duration::from_secs(30))
//!     .start();
//! let remaining = brokkr_core::context::time_to_deadline().unwrap();
//! assert!(remaining <= Duration::from_secs(30));
//! drop(scope);
//! ```

mod factory;
mod propagate;
mod registry;

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::config;
use crate::error::Result;
use crate::time::{self, DeadlineExceeded};
use crate::uid;

pub use factory::{
    context_factory, BasicContextFactory, ExecutionContextFactory, LoggingContextFactory,
};
pub use propagate::{
    deadlined_propagating_callable, deadlined_propagating_callables, propagating_callable,
    propagating_callables, propagating_runnable, DeadlinedPropagatingCallable,
    PropagatingCallable, PropagatingRunnable,
};
pub use registry::{
    attacher, current_operation_id, default_attacher, Attachment, ContextAttacher,
    DiagnosticAttacher, ThreadStackAttacher,
};

/// How a context relates to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Relation {
    /// The parent caused this operation and waits for it.
    #[default]
    ChildOf,
    /// The parent caused this operation but does not wait for it.
    FollowsFrom,
}

/// An effective timeout paired with the absolute deadline it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutDeadline {
    /// Time available to the sub-operation, in nanos.
    pub timeout_nanos: i64,
    /// The instant by which the sub-operation must stop, in monotonic nanos.
    pub deadline_nanos: i64,
}

#[derive(Debug, Default)]
struct State {
    closed: bool,
    children: Vec<Weak<ExecutionContext>>,
    attachments: HashSet<String>,
}

/// The per-operation record.
///
/// Constructed through [`ContextBuilder`] (or the configured factory) and
/// shared as `Arc<ExecutionContext>`. The parent link is used only for
/// deadline inheritance and relation tagging; it implies no ownership in
/// either direction.
#[derive(Debug)]
pub struct ExecutionContext {
    name: String,
    id: OnceLock<String>,
    parent: Option<Arc<ExecutionContext>>,
    relation: Relation,
    start_time_nanos: i64,
    deadline_nanos: i64,
    state: Mutex<State>,
}

impl ExecutionContext {
    pub(crate) fn create(
        name: &str,
        id: Option<String>,
        parent: Option<Arc<ExecutionContext>>,
        relation: Relation,
        start_time_nanos: i64,
        deadline_nanos: i64,
    ) -> Arc<Self> {
        // Deadlines only tighten down the tree.
        let deadline_nanos = match &parent {
            Some(p) => deadline_nanos.min(p.deadline_nanos),
            None => deadline_nanos,
        };
        let lazy_id = OnceLock::new();
        if let Some(id) = id {
            let _ = lazy_id.set(id);
        }
        let ctx = Arc::new(Self {
            name: name.to_string(),
            id: lazy_id,
            parent,
            relation,
            start_time_nanos,
            deadline_nanos,
            state: Mutex::new(State::default()),
        });
        if let Some(parent) = &ctx.parent {
            parent.state.lock().children.push(Arc::downgrade(&ctx));
        }
        ctx
    }

    /// Short human label for the operation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique identifier, generated on first read if none was supplied.
    pub fn id(&self) -> &str {
        self.id.get_or_init(uid::gen_id)
    }

    /// The parent context, if any.
    pub fn parent(&self) -> Option<&Arc<ExecutionContext>> {
        self.parent.as_ref()
    }

    /// How this context relates to its parent.
    pub fn relation(&self) -> Relation {
        self.relation
    }

    /// Monotonic creation timestamp.
    pub fn start_time_nanos(&self) -> i64 {
        self.start_time_nanos
    }

    /// Monotonic instant after which this context is expired.
    pub fn deadline_nanos(&self) -> i64 {
        self.deadline_nanos
    }

    /// Signed time remaining; negative once expired.
    pub fn remaining_nanos(&self) -> i64 {
        time::remaining_nanos(self.deadline_nanos)
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.remaining_nanos() <= 0
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close this context, cascading to any still-open children first.
    ///
    /// Idempotent; only the first call has any effect.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        for child in state.children.drain(..) {
            if let Some(child) = child.upgrade() {
                child.close();
            }
        }
        state.closed = true;
    }

    /// Associate an opaque diagnostic tag. Returns `false` when already set.
    pub fn add_attachment(&self, tag: impl Into<String>) -> bool {
        self.state.lock().attachments.insert(tag.into())
    }

    /// Whether `tag` has been attached.
    pub fn has_attachment(&self, tag: &str) -> bool {
        self.state.lock().attachments.contains(tag)
    }

    /// Snapshot of the attached tags, in no particular order.
    pub fn attachments(&self) -> Vec<String> {
        self.state.lock().attachments.iter().cloned().collect()
    }
}

/// Guard for a started-and-attached context.
///
/// Dereferences to the context; detaches from the thread and closes the
/// context when dropped, on all exit paths. Detach misuse (wrong thread,
/// out-of-order) escalates to a panic from the guard since it is a
/// programmer error; use [`ContextScope::close`] to observe it as an error
/// instead.
pub struct ContextScope {
    context: Arc<ExecutionContext>,
    attachment: Option<Box<dyn Attachment + Send>>,
}

impl ContextScope {
    /// The guarded context.
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    /// Detach and close explicitly, surfacing detach misuse as an error.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let detached = match self.attachment.take() {
            Some(attachment) => attachment.detach(),
            None => Ok(()),
        };
        self.context.close();
        detached
    }
}

impl Deref for ContextScope {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        &self.context
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        if self.attachment.is_none() {
            return;
        }
        if let Err(e) = self.release() {
            if std::thread::panicking() {
                tracing::error!(error = %e, "context detach failed during unwind");
            } else {
                panic!("context detach failed: {e}");
            }
        }
    }
}

/// Builder collapsing the common context-opening shapes.
///
/// Parenting is always explicit: `ContextBuilder::new("op").start()` opens
/// a root context even when another context is currently attached.
#[derive(Debug, Default)]
pub struct ContextBuilder {
    name: String,
    id: Option<String>,
    parent: Option<Arc<ExecutionContext>>,
    relation: Relation,
    timeout: Option<Duration>,
    deadline_nanos: Option<i64>,
}

impl ContextBuilder {
    /// Start describing a context named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Supply the identifier instead of generating one lazily.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Parent this context (relation stays [`Relation::ChildOf`] unless set).
    pub fn parent(mut self, parent: &Arc<ExecutionContext>) -> Self {
        self.parent = Some(Arc::clone(parent));
        self
    }

    /// Parent with the [`Relation::FollowsFrom`] relation.
    pub fn follows_from(mut self, parent: &Arc<ExecutionContext>) -> Self {
        self.parent = Some(Arc::clone(parent));
        self.relation = Relation::FollowsFrom;
        self
    }

    /// Set the relation tag.
    pub fn relation(mut self, relation: Relation) -> Self {
        self.relation = relation;
        self
    }

    /// Bound the context to `now + timeout` (tightened by the parent).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Bound the context to an absolute monotonic deadline.
    pub fn deadline_nanos(mut self, deadline_nanos: i64) -> Self {
        self.deadline_nanos = Some(deadline_nanos);
        self
    }

    fn resolve(&self) -> (i64, i64) {
        let start = time::now_nanos();
        let deadline = if let Some(deadline) = self.deadline_nanos {
            deadline
        } else if let Some(timeout) = self.timeout {
            let requested = time::deadline_from(start, timeout);
            match &self.parent {
                Some(parent) => requested.min(parent.deadline_nanos()),
                None => requested,
            }
        } else if let Some(parent) = &self.parent {
            parent.deadline_nanos()
        } else {
            time::deadline_from(start, config().default_timeout())
        };
        (start, deadline)
    }

    /// Create the context and attach it to the calling thread.
    pub fn start(self) -> ContextScope {
        let context = self.detached();
        let attachment = registry::attacher().attach(Arc::clone(&context));
        ContextScope {
            context,
            attachment: Some(attachment),
        }
    }

    /// Create the context without attaching it anywhere.
    pub fn detached(self) -> Arc<ExecutionContext> {
        let (start_time_nanos, deadline_nanos) = self.resolve();
        factory::context_factory().start(
            &self.name,
            self.id,
            self.parent,
            self.relation,
            start_time_nanos,
            deadline_nanos,
        )
    }
}

/// The ambient context of the calling thread, if one is attached.
pub fn current() -> Option<Arc<ExecutionContext>> {
    registry::current()
}

/// Open a root context with the configured default timeout and attach it.
pub fn start(name: impl Into<String>) -> ContextScope {
    ContextBuilder::new(name).start()
}

/// Open an attached context bounded by `timeout`.
pub fn start_with_timeout(name: impl Into<String>, timeout: Duration) -> ContextScope {
    ContextBuilder::new(name).timeout(timeout).start()
}

/// Open an attached child of `parent`, inheriting its deadline.
pub fn start_child(name: impl Into<String>, parent: &Arc<ExecutionContext>) -> ContextScope {
    ContextBuilder::new(name).parent(parent).start()
}

/// Create a context that is not attached to the calling thread.
pub fn create_detached(name: impl Into<String>) -> Arc<ExecutionContext> {
    ContextBuilder::new(name).detached()
}

/// The ambient deadline: the current context's, or `now + default timeout`.
pub fn context_deadline_nanos() -> i64 {
    match current() {
        Some(ctx) => ctx.deadline_nanos(),
        None => time::deadline_nanos(config().default_timeout()),
    }
}

/// Signed time remaining until the ambient deadline; negative once past.
pub fn time_relative_to_deadline() -> i64 {
    time::remaining_nanos(context_deadline_nanos())
}

/// Non-negative time remaining until the ambient deadline.
///
/// Fails once the current instant is at or past the deadline.
pub fn time_to_deadline() -> std::result::Result<Duration, DeadlineExceeded> {
    time::remaining_duration(context_deadline_nanos())
}

/// Milliseconds remaining until the ambient deadline; saturating cast.
pub fn millis_to_deadline() -> std::result::Result<u64, DeadlineExceeded> {
    time_to_deadline().map(|d| d.as_millis().min(u64::MAX as u128) as u64)
}

/// Whole seconds remaining until the ambient deadline.
pub fn seconds_to_deadline() -> std::result::Result<u64, DeadlineExceeded> {
    time_to_deadline().map(|d| d.as_secs())
}

/// Absolute deadline for a sub-operation requesting `timeout`, bounded by
/// the ambient deadline.
pub fn compute_deadline(timeout: Duration) -> i64 {
    compute_deadline_for(current().as_ref(), timeout)
}

/// Absolute deadline for a sub-operation under `ctx` (or none).
pub fn compute_deadline_for(ctx: Option<&Arc<ExecutionContext>>, timeout: Duration) -> i64 {
    match ctx {
        None => time::deadline_nanos(timeout),
        Some(ctx) => {
            let requested = time::deadline_nanos(timeout);
            requested.min(ctx.deadline_nanos())
        }
    }
}

/// Effective timeout for a sub-operation: the requested one, tightened by
/// the ambient deadline.
pub fn compute_timeout(timeout: Duration) -> std::result::Result<Duration, DeadlineExceeded> {
    compute_timeout_deadline(current().as_ref(), timeout)
        .map(|td| Duration::from_nanos(td.timeout_nanos.max(0) as u64))
}

/// Effective timeout and absolute deadline for a sub-operation.
///
/// This is the normative answer to "I am about to start a sub-operation;
/// how much time do I have and by when must I stop?". Fails when the
/// context's remaining budget is non-positive.
pub fn compute_timeout_deadline(
    ctx: Option<&Arc<ExecutionContext>>,
    timeout: Duration,
) -> std::result::Result<TimeoutDeadline, DeadlineExceeded> {
    let timeout_nanos = timeout.as_nanos().min(i64::MAX as u128) as i64;
    match ctx {
        None => Ok(TimeoutDeadline {
            timeout_nanos,
            deadline_nanos: time::deadline_nanos(timeout),
        }),
        Some(ctx) => {
            let now = time::now_nanos();
            let ctx_deadline = ctx.deadline_nanos();
            let ctx_remaining = ctx_deadline.saturating_sub(now);
            if ctx_remaining <= 0 {
                return Err(DeadlineExceeded {
                    deadline_nanos: ctx_deadline,
                    observed_nanos: now,
                });
            }
            if ctx_remaining < timeout_nanos {
                Ok(TimeoutDeadline {
                    timeout_nanos: ctx_remaining,
                    deadline_nanos: ctx_deadline,
                })
            } else {
                Ok(TimeoutDeadline {
                    timeout_nanos,
                    deadline_nanos: now.saturating_add(timeout_nanos),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_deadline_never_exceeds_the_parent() {
        let parent = ContextBuilder::new("parent")
            .timeout(Duration::from_millis(100))
            .detached();
        let child = ContextBuilder::new("child")
            .parent(&parent)
            .timeout(Duration::from_secs(1))
            .detached();
        assert_eq!(child.deadline_nanos(), parent.deadline_nanos());
        assert_eq!(child.relation(), Relation::ChildOf);

        let tighter = ContextBuilder::new("tighter")
            .parent(&parent)
            .timeout(Duration::from_nanos(1))
            .detached();
        assert!(tighter.deadline_nanos() <= parent.deadline_nanos());
    }

    #[test]
    fn child_inherits_the_parent_deadline_without_a_timeout() {
        let parent = ContextBuilder::new("parent")
            .timeout(Duration::from_secs(5))
            .detached();
        let child = ContextBuilder::new("child").parent(&parent).detached();
        assert_eq!(child.deadline_nanos(), parent.deadline_nanos());
    }

    #[test]
    fn explicit_deadline_is_clamped_to_the_parent() {
        let parent = ContextBuilder::new("parent")
            .timeout(Duration::from_millis(10))
            .detached();
        let child = ContextBuilder::new("child")
            .parent(&parent)
            .deadline_nanos(i64::MAX)
            .detached();
        assert_eq!(child.deadline_nanos(), parent.deadline_nanos());
    }

    #[test]
    fn root_context_uses_the_default_timeout() {
        let before = time::now_nanos();
        let ctx = ContextBuilder::new("root").detached();
        let lower = before + config().default_timeout_nanos;
        assert!(ctx.deadline_nanos() >= lower);
        assert!(ctx.parent().is_none());
    }

    #[test]
    fn scope_attaches_and_detaches() {
        assert!(current().is_none());
        {
            let scope = start("outer");
            let attached = current().unwrap();
            assert!(Arc::ptr_eq(&attached, scope.context()));
            {
                let inner = start_child("inner", scope.context());
                assert!(Arc::ptr_eq(&current().unwrap(), inner.context()));
            }
            assert!(Arc::ptr_eq(&current().unwrap(), scope.context()));
        }
        assert!(current().is_none());
    }

    #[test]
    fn detach_then_reattach_restores_the_stack() {
        let ctx = create_detached("revisited");
        let a = default_attacher().attach(Arc::clone(&ctx));
        a.detach().unwrap();
        assert!(current().is_none());
        let b = default_attacher().attach(Arc::clone(&ctx));
        assert!(Arc::ptr_eq(&current().unwrap(), &ctx));
        b.detach().unwrap();
        assert!(current().is_none());
    }

    #[test]
    fn close_cascades_to_open_children() {
        let parent = create_detached("parent");
        let child = ContextBuilder::new("child").parent(&parent).detached();
        let grandchild = ContextBuilder::new("grandchild").parent(&child).detached();

        assert!(!child.is_closed());
        parent.close();
        assert!(parent.is_closed());
        assert!(child.is_closed());
        assert!(grandchild.is_closed());

        // Idempotent.
        parent.close();
        assert!(parent.is_closed());
    }

    #[test]
    fn scope_closes_its_context_on_drop() {
        let ctx = {
            let scope = start("short-lived");
            Arc::clone(scope.context())
        };
        assert!(ctx.is_closed());
    }

    #[test]
    fn attachments_are_a_set() {
        let ctx = create_detached("tagged");
        assert!(ctx.add_attachment("profiled"));
        assert!(!ctx.add_attachment("profiled"));
        assert!(ctx.has_attachment("profiled"));
        assert!(!ctx.has_attachment("sampled"));
        assert_eq!(ctx.attachments(), vec!["profiled".to_string()]);
    }

    #[test]
    fn id_is_lazily_generated_and_stable() {
        let ctx = create_detached("identified");
        let id = ctx.id().to_string();
        assert!(!id.is_empty());
        assert_eq!(ctx.id(), id);

        let explicit = ContextBuilder::new("named").id("req-42").detached();
        assert_eq!(explicit.id(), "req-42");
    }

    #[test]
    fn ambient_queries_fall_back_to_the_default_timeout() {
        assert!(current().is_none());
        let remaining = time_relative_to_deadline();
        assert!(remaining > 0);
        assert!(remaining <= config().default_timeout_nanos);
        assert!(time_to_deadline().is_ok());
        assert!(millis_to_deadline().unwrap() > 0);
    }

    #[test]
    fn time_to_deadline_fails_once_expired() {
        let scope = ContextBuilder::new("expired")
            .deadline_nanos(time::now_nanos())
            .start();
        assert!(scope.is_expired());
        assert!(time_to_deadline().is_err());
        assert!(time_relative_to_deadline() <= 0);
        scope.close().unwrap();
    }

    #[test]
    fn compute_timeout_deadline_without_a_context() {
        let timeout = Duration::from_secs(2);
        let before = time::now_nanos();
        let td = compute_timeout_deadline(None, timeout).unwrap();
        assert_eq!(td.timeout_nanos, timeout.as_nanos() as i64);
        assert!(td.deadline_nanos >= before + td.timeout_nanos);
    }

    #[test]
    fn compute_timeout_deadline_tightens_to_the_context() {
        let ctx = ContextBuilder::new("tight")
            .timeout(Duration::from_millis(50))
            .detached();
        let td = compute_timeout_deadline(Some(&ctx), Duration::from_secs(10)).unwrap();
        assert_eq!(td.deadline_nanos, ctx.deadline_nanos());
        assert!(td.timeout_nanos <= Duration::from_millis(50).as_nanos() as i64);

        let roomy = compute_timeout_deadline(Some(&ctx), Duration::from_nanos(10)).unwrap();
        assert_eq!(roomy.timeout_nanos, 10);
        assert!(roomy.deadline_nanos <= ctx.deadline_nanos());
    }

    #[test]
    fn compute_timeout_deadline_fails_on_an_expired_context() {
        let ctx = ContextBuilder::new("spent")
            .deadline_nanos(time::now_nanos())
            .detached();
        assert!(compute_timeout_deadline(Some(&ctx), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn compute_deadline_saturates() {
        let deadline = compute_deadline_for(None, Duration::MAX);
        assert_eq!(deadline, i64::MAX);
    }

    #[test]
    fn follows_from_keeps_deadline_inheritance() {
        let parent = ContextBuilder::new("origin")
            .timeout(Duration::from_millis(200))
            .detached();
        let follower = ContextBuilder::new("follower")
            .follows_from(&parent)
            .detached();
        assert_eq!(follower.relation(), Relation::FollowsFrom);
        assert_eq!(follower.deadline_nanos(), parent.deadline_nanos());
    }
}
