//! Per-thread context attachment
//!
//! Each thread carries a small stack of attached contexts; the top of the
//! stack is the ambient "current context". Attach/detach must be balanced
//! on the same thread, and detaching anything but the top of the stack is
//! a programmer error reported loudly rather than papered over.

use std::cell::RefCell;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::config::{config, AttacherKind};
use crate::error::{Error, Result};

use super::ExecutionContext;

thread_local! {
    static STACK: RefCell<Vec<Arc<ExecutionContext>>> = RefCell::new(Vec::with_capacity(4));

    /// Diagnostic slot mirroring the current context id, maintained only by
    /// the [`DiagnosticAttacher`].
    static OPERATION_ID: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// The context on top of the calling thread's stack, if any.
pub(crate) fn current() -> Option<Arc<ExecutionContext>> {
    STACK.with(|stack| stack.borrow().last().cloned())
}

#[cfg(test)]
pub(crate) fn stack_depth() -> usize {
    STACK.with(|stack| stack.borrow().len())
}

/// The operation id mirrored by the diagnostic attacher, if one is active.
pub fn current_operation_id() -> Option<String> {
    OPERATION_ID.with(|slot| slot.borrow().clone())
}

/// A live attachment of a context to one thread.
///
/// The handle's sole operation is [`detach`](Attachment::detach); it
/// remembers which thread it was created on and which stack position it
/// occupies so misuse can be diagnosed precisely.
pub trait Attachment {
    /// Undo the attachment.
    ///
    /// Fails when called from a different thread than the attaching one, or
    /// when the expected context is no longer the top of the stack (a
    /// sibling attachment leaked). The stack is left unchanged on failure.
    fn detach(self: Box<Self>) -> Result<()>;

    /// Whether this attachment is the outermost one on its thread.
    fn is_outermost(&self) -> bool;

    /// The thread the context was attached on.
    fn attached_thread(&self) -> ThreadId;

    /// The attached context.
    fn context(&self) -> &Arc<ExecutionContext>;
}

/// Pluggable attachment scheme, chosen once at startup from configuration.
pub trait ContextAttacher: Send + Sync {
    /// Push `ctx` onto the calling thread's stack and hand back the handle
    /// that undoes it.
    fn attach(&self, ctx: Arc<ExecutionContext>) -> Box<dyn Attachment + Send>;
}

fn push(ctx: &Arc<ExecutionContext>) -> usize {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push(Arc::clone(ctx));
        stack.len() - 1
    })
}

fn pop_expected(ctx: &Arc<ExecutionContext>, attached: ThreadId) -> Result<()> {
    let detaching = thread::current().id();
    if detaching != attached {
        return Err(Error::DetachWrongThread {
            context: ctx.name().to_string(),
            attached,
            detaching,
        });
    }
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.pop() {
            Some(top) if Arc::ptr_eq(&top, ctx) => Ok(()),
            Some(top) => {
                stack.push(top);
                Err(Error::DetachOutOfOrder {
                    context: ctx.name().to_string(),
                })
            }
            None => Err(Error::DetachOutOfOrder {
                context: ctx.name().to_string(),
            }),
        }
    })
}

struct StackAttachment {
    thread: ThreadId,
    ctx: Arc<ExecutionContext>,
    index: usize,
}

impl Attachment for StackAttachment {
    fn detach(self: Box<Self>) -> Result<()> {
        pop_expected(&self.ctx, self.thread)
    }

    fn is_outermost(&self) -> bool {
        self.index == 0
    }

    fn attached_thread(&self) -> ThreadId {
        self.thread
    }

    fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }
}

/// The default attacher: per-thread stack only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadStackAttacher;

impl ContextAttacher for ThreadStackAttacher {
    fn attach(&self, ctx: Arc<ExecutionContext>) -> Box<dyn Attachment + Send> {
        let index = push(&ctx);
        Box::new(StackAttachment {
            thread: thread::current().id(),
            ctx,
            index,
        })
    }
}

struct DiagnosticAttachment {
    inner: StackAttachment,
    previous_id: Option<String>,
}

impl Attachment for DiagnosticAttachment {
    fn detach(self: Box<Self>) -> Result<()> {
        let previous = self.previous_id;
        Box::new(self.inner).detach()?;
        OPERATION_ID.with(|slot| *slot.borrow_mut() = previous);
        Ok(())
    }

    fn is_outermost(&self) -> bool {
        self.inner.is_outermost()
    }

    fn attached_thread(&self) -> ThreadId {
        self.inner.attached_thread()
    }

    fn context(&self) -> &Arc<ExecutionContext> {
        self.inner.context()
    }
}

/// Attacher that additionally mirrors the context id into a thread-local
/// slot that logging integrations can read via [`current_operation_id`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticAttacher;

impl ContextAttacher for DiagnosticAttacher {
    fn attach(&self, ctx: Arc<ExecutionContext>) -> Box<dyn Attachment + Send> {
        let id = ctx.id().to_string();
        let index = push(&ctx);
        let previous_id = OPERATION_ID.with(|slot| slot.borrow_mut().replace(id));
        Box::new(DiagnosticAttachment {
            inner: StackAttachment {
                thread: thread::current().id(),
                ctx,
                index,
            },
            previous_id,
        })
    }
}

static THREAD_STACK: ThreadStackAttacher = ThreadStackAttacher;
static DIAGNOSTIC: DiagnosticAttacher = DiagnosticAttacher;

/// The attacher selected by configuration.
pub fn attacher() -> &'static dyn ContextAttacher {
    match config().attacher {
        AttacherKind::ThreadStack => &THREAD_STACK,
        AttacherKind::Diagnostic => &DIAGNOSTIC,
    }
}

/// The stack-only attacher, independent of configuration.
pub fn default_attacher() -> &'static ThreadStackAttacher {
    &THREAD_STACK
}
