//! Thread-local runtime context
//!
//! Every OS thread that touches the runtime carries:
//! - the fiber currently executing on it,
//! - its root fiber (the native stack, materialized on first use),
//! - the scheduler anchor fiber, when the thread is a worker,
//! - a weak handle to the scheduler it belongs to,
//! - the hook-enable flag consulted by the syscall shims.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static ROOT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHEDULER_ANCHOR: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static CURRENT_SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// The fiber currently executing on this thread, if any.
#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub(crate) fn set_current_fiber(fiber: Arc<Fiber>) {
    CURRENT_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
}

/// This thread's root fiber, if it was materialized.
#[inline]
pub(crate) fn root_fiber() -> Option<Arc<Fiber>> {
    ROOT_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub(crate) fn set_root_fiber(fiber: Arc<Fiber>) {
    ROOT_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
}

/// The scheduler anchor fiber of this worker thread.
///
/// Bound fibers swap against this; on spawned workers it is the thread's
/// root fiber, on a `use_caller` thread it is the dedicated worker-loop
/// fiber.
#[inline]
pub fn scheduler_anchor() -> Option<Arc<Fiber>> {
    SCHEDULER_ANCHOR.with(|cell| cell.borrow().clone())
}

#[inline]
pub(crate) fn set_scheduler_anchor(fiber: Arc<Fiber>) {
    SCHEDULER_ANCHOR.with(|cell| *cell.borrow_mut() = Some(fiber));
}

/// The scheduler this thread participates in, if still alive.
#[inline]
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
}

#[inline]
pub(crate) fn set_current_scheduler(scheduler: Weak<Scheduler>) {
    CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = Some(scheduler));
}

/// Whether hooked syscalls on this thread cooperate with the reactor.
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|cell| cell.get())
}

/// Flip the hook gate for this thread. Worker loops enable it on entry;
/// everything else defaults to raw syscalls.
#[inline]
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|cell| cell.set(enabled));
}
