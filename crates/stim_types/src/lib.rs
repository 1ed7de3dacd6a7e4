//! Shared types for the stim link driver
//!
//! This crate contains the wire-level model used throughout the closed-loop
//! link system: framed packets, transaction opcodes, device fault codes,
//! decoded stream samples, and the subscriber event surface.

pub mod command;
pub mod event;
pub mod packet;
pub mod stream;

// Re-export commonly used types
pub use command::*;
pub use event::*;
pub use packet::*;
pub use stream::*;

/// Serial read timeout and keepalive period, in milliseconds.
pub const MAX_TIMEOUT_MS: u64 = 5_000;

/// Idle polling sleep used by every queue-draining loop, in milliseconds.
pub const MIN_TIMEOUT_MS: u64 = 100;
