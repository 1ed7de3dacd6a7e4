//! Guarded command submission.
//!
//! Both the public API and the detector's closed loop request commands
//! through this gate, so the sent-but-unacked flags are enforced in one
//! place and at most one request per opcode is outstanding. The commander
//! task drains the queue and serializes the actual wire traffic.

use std::sync::Arc;

use log::debug;

use crate::error::CommandRefused;
use crate::queues::LinkQueues;
use crate::session::{LinkStatus, SessionState};
use stim_types::OpCode;

/// Admission control for outbound commands.
#[derive(Clone)]
pub struct CommandGate {
    session: Arc<SessionState>,
    queues: Arc<LinkQueues>,
}

impl CommandGate {
    pub fn new(session: Arc<SessionState>, queues: Arc<LinkQueues>) -> Self {
        Self { session, queues }
    }

    pub fn start_streaming(&self) -> Result<(), CommandRefused> {
        self.ensure_running()?;
        if self.session.start_stream_sent() {
            return Err(CommandRefused::AlreadyRequested(OpCode::StartStream));
        }
        self.session.set_user_streaming(true);
        self.session.set_start_stream_sent(true);
        self.push(OpCode::StartStream)
            .inspect_err(|_| self.session.set_start_stream_sent(false))
    }

    pub fn stop_streaming(&self) -> Result<(), CommandRefused> {
        self.ensure_running()?;
        if self.session.stop_stream_sent() {
            return Err(CommandRefused::AlreadyRequested(OpCode::StopStream));
        }
        self.session.set_user_streaming(false);
        self.session.set_stop_stream_sent(true);
        self.push(OpCode::StopStream)
            .inspect_err(|_| self.session.set_stop_stream_sent(false))
    }

    pub fn start_therapy(&self) -> Result<(), CommandRefused> {
        self.ensure_running()?;
        if self.session.is_stimming() {
            return Err(CommandRefused::TherapyActive);
        }
        if self.session.start_stim_sent() {
            return Err(CommandRefused::AlreadyRequested(OpCode::StartStim));
        }
        self.session.set_start_stim_sent(true);
        self.push(OpCode::StartStim)
            .inspect_err(|_| self.session.set_start_stim_sent(false))
    }

    pub fn stop_therapy(&self) -> Result<(), CommandRefused> {
        self.ensure_running()?;
        if !self.session.is_stimming() {
            return Err(CommandRefused::TherapyInactive);
        }
        if self.session.stop_stim_sent() {
            return Err(CommandRefused::AlreadyRequested(OpCode::StopStim));
        }
        self.session.set_stop_stim_sent(true);
        self.push(OpCode::StopStim)
            .inspect_err(|_| self.session.set_stop_stim_sent(false))
    }

    fn ensure_running(&self) -> Result<(), CommandRefused> {
        if self.session.status() != LinkStatus::Running {
            return Err(CommandRefused::NotRunning);
        }
        Ok(())
    }

    fn push(&self, op: OpCode) -> Result<(), CommandRefused> {
        if self.queues.commands.try_push(op) {
            debug!("queued {:?} command", op);
            Ok(())
        } else {
            Err(CommandRefused::QueueFull)
        }
    }
}
