//! Architecture-specific context switching
//!
//! Each supported architecture provides:
//! - `Context`: the callee-saved register set of a suspended fiber
//! - `init_context`: prepare a fresh context that enters a trampoline
//! - `switch_context`: save the current registers and load another set
//!
//! Only the voluntary switch exists; fibers are never preempted, so the
//! caller-saved registers do not need to be preserved.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{init_context, switch_context, Context};

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::{init_context, switch_context, Context};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("filament-runtime supports x86_64 and aarch64 only");
