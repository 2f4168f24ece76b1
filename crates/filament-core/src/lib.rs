//! # filament-core
//!
//! Core types for the filament fiber runtime.
//!
//! This crate has no scheduling logic of its own; it holds the vocabulary
//! shared by `filament-runtime` and `filament-io`:
//!
//! - `id` - fiber identifier type and generator
//! - `state` - fiber state machine
//! - `error` - error types
//! - `time` - monotonic millisecond clock
//! - `os` - OS thread id helper
//! - `config` - typed configuration registry with change listeners

pub mod config;
pub mod error;
pub mod id;
pub mod os;
pub mod state;
pub mod time;

pub use config::{lookup, ConfigVar};
pub use error::{Result, RuntimeError};
pub use id::FiberId;
pub use state::FiberState;
pub use time::monotonic_ms;
