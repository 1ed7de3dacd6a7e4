//! Process-wide session state.
//!
//! The supervisor owns all transitions; every task reads the flags
//! atomically. Sent-but-unacked request flags guard against duplicate
//! commands until the device acknowledges or reports an advisory fault.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Lifecycle status of the link.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Created = 0,
    Opened = 1,
    Connected = 2,
    Running = 3,
    Restart = 4,
    Stopping = 5,
    Error = 6,
}

impl LinkStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkStatus::Opened,
            2 => LinkStatus::Connected,
            3 => LinkStatus::Running,
            4 => LinkStatus::Restart,
            5 => LinkStatus::Stopping,
            6 => LinkStatus::Error,
            _ => LinkStatus::Created,
        }
    }
}

/// Shared session flags.
#[derive(Debug)]
pub struct SessionState {
    status: AtomicU8,
    is_streaming: AtomicBool,
    is_stimming: AtomicBool,
    start_stream_sent: AtomicBool,
    stop_stream_sent: AtomicBool,
    start_stim_sent: AtomicBool,
    stop_stim_sent: AtomicBool,
    user_streaming: AtomicBool,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(LinkStatus::Created as u8),
            is_streaming: AtomicBool::new(false),
            is_stimming: AtomicBool::new(false),
            start_stream_sent: AtomicBool::new(false),
            stop_stream_sent: AtomicBool::new(false),
            start_stim_sent: AtomicBool::new(false),
            stop_stim_sent: AtomicBool::new(false),
            user_streaming: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: LinkStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming.load(Ordering::SeqCst)
    }

    pub fn set_streaming(&self, on: bool) {
        self.is_streaming.store(on, Ordering::SeqCst);
    }

    pub fn is_stimming(&self) -> bool {
        self.is_stimming.load(Ordering::SeqCst)
    }

    pub fn set_stimming(&self, on: bool) {
        self.is_stimming.store(on, Ordering::SeqCst);
    }

    pub fn start_stream_sent(&self) -> bool {
        self.start_stream_sent.load(Ordering::SeqCst)
    }

    pub fn set_start_stream_sent(&self, on: bool) {
        self.start_stream_sent.store(on, Ordering::SeqCst);
    }

    pub fn stop_stream_sent(&self) -> bool {
        self.stop_stream_sent.load(Ordering::SeqCst)
    }

    pub fn set_stop_stream_sent(&self, on: bool) {
        self.stop_stream_sent.store(on, Ordering::SeqCst);
    }

    pub fn start_stim_sent(&self) -> bool {
        self.start_stim_sent.load(Ordering::SeqCst)
    }

    pub fn set_start_stim_sent(&self, on: bool) {
        self.start_stim_sent.store(on, Ordering::SeqCst);
    }

    pub fn stop_stim_sent(&self) -> bool {
        self.stop_stim_sent.load(Ordering::SeqCst)
    }

    pub fn set_stop_stim_sent(&self, on: bool) {
        self.stop_stim_sent.store(on, Ordering::SeqCst);
    }

    /// The stream state the user last asked for; survives reconnects.
    pub fn user_streaming(&self) -> bool {
        self.user_streaming.load(Ordering::SeqCst)
    }

    pub fn set_user_streaming(&self, on: bool) {
        self.user_streaming.store(on, Ordering::SeqCst);
    }

    /// Clear every sent-but-unacked flag (advisory device faults).
    pub fn clear_sent_flags(&self) {
        self.set_start_stream_sent(false);
        self.set_stop_stream_sent(false);
        self.set_start_stim_sent(false);
        self.set_stop_stim_sent(false);
    }

    /// Reset the in-flight request state ahead of a fresh handshake.
    pub fn reset_for_reconnect(&self) {
        self.set_stimming(false);
        self.clear_sent_flags();
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic 8-bit packet id source, wrapping at 256.
#[derive(Debug, Default)]
pub struct PacketIdGen(AtomicU8);

impl PacketIdGen {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn next(&self) -> u8 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_wrap_at_256() {
        let ids = PacketIdGen::new();
        for expected in 0..=255u8 {
            assert_eq!(ids.next(), expected);
        }
        assert_eq!(ids.next(), 0);
    }

    #[test]
    fn reset_for_reconnect_clears_stim_and_sent_flags() {
        let session = SessionState::new();
        session.set_stimming(true);
        session.set_streaming(true);
        session.set_start_stim_sent(true);
        session.set_stop_stream_sent(true);
        session.set_user_streaming(true);

        session.reset_for_reconnect();

        assert!(!session.is_stimming());
        assert!(!session.start_stim_sent());
        assert!(!session.stop_stream_sent());
        // Streaming intent and the last acked stream state are untouched.
        assert!(session.is_streaming());
        assert!(session.user_streaming());
    }

    #[test]
    fn status_round_trips() {
        let session = SessionState::new();
        assert_eq!(session.status(), LinkStatus::Created);
        session.set_status(LinkStatus::Running);
        assert_eq!(session.status(), LinkStatus::Running);
    }
}
