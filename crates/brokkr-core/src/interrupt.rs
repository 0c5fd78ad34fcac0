//! Per-worker interruption
//!
//! A cooperative cancellation primitive: every thread owns an interrupt
//! flag that other threads can raise through an [`InterruptHandle`].
//! Raising the flag also wakes any interruptible sleep in progress on the
//! owning thread, so a sleeping retry loop reacts within notification
//! latency rather than at the end of its delay.
//!
//! The flag follows the read-and-clear discipline: [`sleep`] and
//! [`take_interrupted`] consume it, and code that propagates an
//! [`Interrupted`] failure is expected to call [`set_interrupted`] first so
//! the caller can still observe the state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// The worker's interruption flag was observed.
#[derive(Debug, Clone, Copy, Error)]
#[error("worker interrupted")]
pub struct Interrupted;

#[derive(Debug, Default)]
struct Cell {
    flag: AtomicBool,
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl Cell {
    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

thread_local! {
    static CURRENT: Arc<Cell> = Arc::new(Cell::default());
}

fn current() -> Arc<Cell> {
    CURRENT.with(Arc::clone)
}

/// A handle to another thread's interrupt flag.
///
/// Cloneable and `Send`; obtained on the thread to be interrupted via
/// [`handle`] and passed to whichever thread delivers the signal.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    cell: Arc<Cell>,
}

impl InterruptHandle {
    /// Raise the flag and wake any interruptible sleep on the owning thread.
    pub fn interrupt(&self) {
        // Taking the lock orders the store against a sleeper's check-then-wait.
        let _guard = self.cell.lock.lock();
        self.cell.flag.store(true, Ordering::SeqCst);
        self.cell.wakeup.notify_all();
    }

    /// Whether the flag is currently raised.
    pub fn is_interrupted(&self) -> bool {
        self.cell.flag.load(Ordering::SeqCst)
    }
}

/// Handle to the calling thread's own interrupt flag.
pub fn handle() -> InterruptHandle {
    InterruptHandle { cell: current() }
}

/// Whether the calling thread's flag is raised, without clearing it.
pub fn is_interrupted() -> bool {
    current().flag.load(Ordering::SeqCst)
}

/// Read and clear the calling thread's flag.
pub fn take_interrupted() -> bool {
    current().take()
}

/// Raise the calling thread's own flag.
///
/// Used to restore the flag before propagating an [`Interrupted`] failure.
pub fn set_interrupted() {
    let cell = current();
    let _guard = cell.lock.lock();
    cell.flag.store(true, Ordering::SeqCst);
}

/// Sleep for `timeout`, waking early if the calling thread is interrupted.
///
/// Clears the flag and fails if it was already raised or becomes raised
/// during the sleep.
pub fn sleep(timeout: Duration) -> Result<(), Interrupted> {
    let cell = current();
    let deadline = Instant::now() + timeout;
    let mut guard = cell.lock.lock();
    loop {
        if cell.take() {
            return Err(Interrupted);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        let _ = cell.wakeup.wait_for(&mut guard, deadline - now);
    }
}
