//! # filament-runtime
//!
//! Fibers, the N:M scheduler, and the timer wheel.
//!
//! ```ignore
//! use filament_runtime::Scheduler;
//!
//! let sched = Scheduler::new(2, false, "pool");
//! sched.start();
//! sched.schedule(|| println!("hello from a fiber"));
//! sched.stop();
//! ```
//!
//! - `arch` - per-architecture context switch (x86_64, aarch64)
//! - `stack` - guarded mmap fiber stacks
//! - `fiber` - stackful coroutine with resume/yield/reset
//! - `tls` - per-thread runtime context (current fiber, anchors, hook gate)
//! - `scheduler` - worker pool draining a shared FIFO
//! - `timer` - deadline-ordered timer wheel

pub mod arch;
pub mod fiber;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;

pub use fiber::Fiber;
pub use filament_core::state::FiberState;
pub use scheduler::{Reactor, ScheduleTask, Scheduler, ANY_WORKER};
pub use timer::{Timer, TimerCallback, TimerWheel};
