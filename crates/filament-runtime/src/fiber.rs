//! Stackful fibers
//!
//! A fiber is a cooperatively scheduled execution context with its own
//! guarded stack. Exactly one fiber runs per OS thread at any instant;
//! `resume` switches into a fiber and blocks the caller's path until the
//! fiber yields or terminates.
//!
//! Every thread lazily materializes a *root fiber* on first use — a
//! stackless shell standing for the native stack, used purely as a swap
//! anchor. Fibers created with `bound_to_scheduler` swap against the
//! worker's scheduler anchor instead (see `tls`).

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use filament_core::config::{self, ConfigVar};
use filament_core::error::Result;
use filament_core::id::FiberId;
use filament_core::state::{AtomicFiberState, FiberState};

use crate::arch;
use crate::stack::FiberStack;
use crate::tls;

static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

type EntryFn = Box<dyn FnOnce() + Send + 'static>;

fn stack_size_var() -> &'static Arc<ConfigVar<u32>> {
    static VAR: std::sync::OnceLock<Arc<ConfigVar<u32>>> = std::sync::OnceLock::new();
    VAR.get_or_init(|| config::lookup("fiber.stack_size", 128 * 1024u32, "fiber stack size"))
}

/// A stackful coroutine.
pub struct Fiber {
    id: FiberId,
    state: AtomicFiberState,
    ctx: UnsafeCell<arch::Context>,
    stack: Option<FiberStack>,
    entry: Mutex<Option<EntryFn>>,
    bound_to_scheduler: bool,
}

// `ctx` is only touched by the thread performing the switch, and the
// runtime guarantees a fiber is resumed by at most one thread at a time
// (the Ready -> Running CAS in `resume`). Everything else is atomic or
// mutex-guarded.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber in `Ready` state.
    ///
    /// `stack_size` of 0 selects the `fiber.stack_size` config default.
    /// `bound_to_scheduler` decides the swap anchor: the worker's
    /// scheduler anchor, or the thread's root fiber.
    pub fn new(
        entry: impl FnOnce() + Send + 'static,
        stack_size: usize,
        bound_to_scheduler: bool,
    ) -> Result<Arc<Fiber>> {
        let size = if stack_size == 0 {
            stack_size_var().value() as usize
        } else {
            stack_size
        };
        let stack = FiberStack::alloc(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicFiberState::new(FiberState::Ready),
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            stack: Some(stack),
            entry: Mutex::new(Some(Box::new(entry))),
            bound_to_scheduler,
        });

        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_entry,
                Arc::as_ptr(&fiber) as usize,
            );
        }

        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        log::trace!("fiber {} created", fiber.id);
        Ok(fiber)
    }

    /// Shell fiber standing for the thread's native stack.
    fn new_root() -> Arc<Fiber> {
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicFiberState::new(FiberState::Running),
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            stack: None,
            entry: Mutex::new(None),
            bound_to_scheduler: false,
        });
        log::trace!("root fiber {} created", fiber.id);
        fiber
    }

    /// The fiber currently running on this thread.
    ///
    /// First use on a thread materializes its root fiber.
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = tls::current_fiber() {
            return fiber;
        }
        let root = Fiber::new_root();
        tls::set_root_fiber(root.clone());
        tls::set_current_fiber(root.clone());
        root
    }

    /// Id of the current fiber, or 0 when called off-fiber.
    pub fn current_id() -> u64 {
        tls::current_fiber().map_or(0, |f| f.id.as_u64())
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    #[inline]
    pub fn is_bound_to_scheduler(&self) -> bool {
        self.bound_to_scheduler
    }

    /// Whether this is a thread's root fiber.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.stack.is_none()
    }

    /// Switch into this fiber. Returns when it yields or terminates.
    ///
    /// # Panics
    ///
    /// Panics if the fiber is not `Ready`, if it is a root fiber, or if a
    /// bound fiber is resumed on a thread without a scheduler anchor.
    pub fn resume(self: &Arc<Self>) {
        assert!(!self.is_root(), "cannot resume a root fiber");
        assert!(
            self.state.transition(FiberState::Ready, FiberState::Running),
            "resume of fiber {} in state {}",
            self.id,
            self.state.get()
        );

        let anchor = if self.bound_to_scheduler {
            tls::scheduler_anchor()
                .expect("resume of a scheduler-bound fiber outside a worker thread")
        } else {
            Fiber::current(); // materialize the root on first use
            tls::root_fiber().unwrap()
        };
        debug_assert!(!Arc::ptr_eq(&anchor, self));

        tls::set_current_fiber(self.clone());
        unsafe {
            arch::switch_context(anchor.ctx.get(), self.ctx.get());
        }

        // Back on the anchor: the fiber yielded or terminated. Only now
        // is its context fully saved, so only now may it become Ready.
        tls::set_current_fiber(anchor.clone());
        self.state.transition(FiberState::Yielding, FiberState::Ready);
    }

    /// Suspend the current fiber and switch back to its anchor.
    ///
    /// Does not re-enqueue: whoever wakes the fiber (event, timer,
    /// explicit schedule) is responsible for that.
    pub fn yield_now() {
        let current = tls::current_fiber().expect("yield_now outside a fiber");
        assert!(!current.is_root(), "the root fiber cannot yield");
        current.switch_to_anchor();
    }

    /// Re-arm a terminated fiber with a new entry closure, reusing its
    /// stack. Only valid in `Term`.
    pub fn reset(self: &Arc<Self>, entry: impl FnOnce() + Send + 'static) {
        assert!(!self.is_root(), "cannot reset a root fiber");
        assert_eq!(
            self.state.get(),
            FiberState::Term,
            "reset of fiber {} before termination",
            self.id
        );
        *self.entry.lock() = Some(Box::new(entry));
        unsafe {
            arch::init_context(
                self.ctx.get(),
                self.stack.as_ref().unwrap().top(),
                fiber_entry,
                Arc::as_ptr(self) as usize,
            );
        }
        self.state.set(FiberState::Ready);
    }

    /// Number of live fibers in the process, roots included.
    pub fn live_count() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    fn switch_to_anchor(&self) {
        let state = self.state.get();
        debug_assert!(state == FiberState::Running || state == FiberState::Term);
        if state != FiberState::Term {
            // Not Ready yet: the resuming side promotes Yielding to Ready
            // once the swap below has completed, closing the window in
            // which another worker could resume a half-saved context.
            self.state.set(FiberState::Yielding);
        }

        let anchor = if self.bound_to_scheduler {
            tls::scheduler_anchor().expect("yield of a bound fiber outside a worker thread")
        } else {
            tls::root_fiber().expect("yield with no root fiber")
        };
        unsafe {
            arch::switch_context(self.ctx.get(), anchor.ctx.get());
        }
        // Execution continues here on the next resume.
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        if self.is_root() {
            log::trace!("root fiber {} destroyed", self.id);
            return;
        }
        // A stackful fiber may only be dropped once terminated, or before
        // it ever ran (entry still present after create/reset).
        let state = self.state.get();
        assert!(
            state == FiberState::Term
                || (state == FiberState::Ready && self.entry.get_mut().is_some()),
            "fiber {} dropped in state {}",
            self.id,
            state
        );
        log::trace!("fiber {} destroyed", self.id);
    }
}

/// Entry point of every stackful fiber. Runs the closure, marks `Term`,
/// and switches back to the anchor; never returns.
extern "C" fn fiber_entry(fiber_ptr: usize) {
    let fiber = unsafe { &*(fiber_ptr as *const Fiber) };

    let entry = fiber
        .entry
        .lock()
        .take()
        .expect("fiber entry closure missing");
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
        // A fault in one fiber must not take down the worker; the fiber
        // simply terminates.
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        log::error!("fiber {} panicked: {}", fiber.id, msg);
    }

    fiber.state.set(FiberState::Term);
    fiber.switch_to_anchor();
    unreachable!("terminated fiber {} was resumed", fiber.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fiber_runs_to_term() {
        Fiber::current();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let fiber = Fiber::new(
            move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            },
            16 * 1024,
            false,
        )
        .unwrap();

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_yield_and_resume_round_trip() {
        Fiber::current();
        let steps = Arc::new(AtomicUsize::new(0));
        let steps2 = steps.clone();
        let fiber = Fiber::new(
            move || {
                steps2.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_now();
                steps2.fetch_add(1, Ordering::SeqCst);
            },
            16 * 1024,
            false,
        )
        .unwrap();

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_the_stack() {
        Fiber::current();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let fiber = Fiber::new(
            move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            },
            16 * 1024,
            false,
        )
        .unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let hits3 = hits.clone();
        fiber.reset(move || {
            hits3.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_panicking_fiber_terminates_cleanly() {
        Fiber::current();
        let fiber = Fiber::new(
            || {
                panic!("inside fiber");
            },
            16 * 1024,
            false,
        )
        .unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_current_materializes_root() {
        std::thread::spawn(|| {
            let root = Fiber::current();
            assert!(root.is_root());
            assert_eq!(root.state(), FiberState::Running);
            assert!(Arc::ptr_eq(&root, &Fiber::current()));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_ids_increase() {
        Fiber::current();
        let a = Fiber::new(|| {}, 16 * 1024, false).unwrap();
        let b = Fiber::new(|| {}, 16 * 1024, false).unwrap();
        assert!(b.id().as_u64() > a.id().as_u64());
        // Never-started fibers may be dropped.
        drop(a);
        drop(b);
    }
}
