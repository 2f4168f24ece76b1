//! # filament-io
//!
//! The I/O half of the filament runtime: an epoll reactor that extends
//! the scheduler, the per-fd registry, and the hooked blocking syscalls
//! that let fibers use a synchronous programming model over
//! reactor-driven await points.
//!
//! - `fd` - per-fd bookkeeping (socket flag, non-blocking views, deadlines)
//! - `notifier` - eventfd wakeup for the epoll loop
//! - `iomanager` - the reactor: event registration, cancellation, timers
//! - `hook` - POSIX-shaped blocking calls that cooperate with the reactor

pub mod fd;
pub mod hook;
pub mod iomanager;
pub mod notifier;

pub use fd::{FdEntry, FdRegistry, TimeoutKind, NO_TIMEOUT};
pub use iomanager::{Event, IoManager};
