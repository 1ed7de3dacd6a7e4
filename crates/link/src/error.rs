//! Error types for the link runtime.

use thiserror::Error;

use stim_types::{FrameError, OpCode};

/// Link-level errors.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no serial port accepted the handshake")]
    NoPortAvailable,

    #[error("handshake failed after {attempts} attempts")]
    HandshakeFailed { attempts: u32 },

    #[error("port is not open")]
    PortClosed,

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Why a user or closed-loop command was not queued.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CommandRefused {
    #[error("link is not running")]
    NotRunning,

    #[error("{0:?} request already in flight")]
    AlreadyRequested(OpCode),

    #[error("therapy is already active")]
    TherapyActive,

    #[error("therapy is not active")]
    TherapyInactive,

    #[error("command queue is full")]
    QueueFull,
}
