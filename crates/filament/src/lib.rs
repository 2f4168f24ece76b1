//! # filament
//!
//! An M:N stackful fiber runtime for Linux servers: a pool of worker
//! threads multiplexes many lightweight fibers over one epoll reactor
//! with an embedded timer wheel. Code running on a fiber keeps the
//! synchronous shape — it calls what look like blocking socket reads —
//! while the hook layer parks the fiber on the reactor and resumes it
//! when the fd is ready or a deadline fires.
//!
//! ## Quick start
//!
//! ```ignore
//! use filament::IoManager;
//!
//! let iom = IoManager::new(2, true, "main").unwrap();
//! iom.schedule(|| {
//!     // Looks blocking; parks the fiber, not the thread.
//!     let fd = filament::hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
//!     // ... connect / read / write through filament::hook ...
//!     filament::hook::close(fd);
//! });
//! iom.stop(); // drains, then joins the workers
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       user fibers                        │
//! │        hook::read / hook::connect / hook::sleep          │
//! └──────────────────────────────────────────────────────────┘
//!                             │ EAGAIN → park
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  IoManager: epoll loop as the idle task + timer wheel    │
//! │  readiness → push waiter onto the scheduler ready queue  │
//! └──────────────────────────────────────────────────────────┘
//!                             │
//!              ┌──────────────┼──────────────┐
//!              ▼              ▼              ▼
//!        ┌──────────┐   ┌──────────┐   ┌──────────┐
//!        │  worker  │   │  worker  │   │  caller  │
//!        │  thread  │   │  thread  │   │ (stop()) │
//!        └──────────┘   └──────────┘   └──────────┘
//! ```

pub use filament_core::{config, ConfigVar, FiberId, FiberState, Result, RuntimeError};
pub use filament_core::{os, time};

pub use filament_runtime::scheduler::{Reactor, ScheduleTask, Scheduler, ANY_WORKER};
pub use filament_runtime::timer::{Timer, TimerCallback, TimerWheel};
pub use filament_runtime::{tls, Fiber};

pub use filament_io::hook;
pub use filament_io::{Event, FdEntry, FdRegistry, IoManager, TimeoutKind};

/// Suspend the current fiber; see [`Fiber::yield_now`].
#[inline]
pub fn yield_now() {
    Fiber::yield_now();
}
