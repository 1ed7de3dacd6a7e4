//! The six long-running link tasks.
//!
//! Each task is a loop over its input queue that converts failures into a
//! task-exit outcome instead of unwinding; the supervisor observes exits
//! and restarts the group. Sorter, detector, and notifier finish draining
//! their input queue before honoring a kill order.

pub(crate) mod commander;
pub(crate) mod detector;
pub(crate) mod keepalive;
pub(crate) mod listener;
pub(crate) mod notifier;
pub(crate) mod sorter;

use std::io;
use std::sync::{Arc, Mutex, RwLock};

use crate::port::LinkPort;
use crate::queues::LinkQueues;
use crate::recorder::SampleRecorder;
use crate::session::{PacketIdGen, SessionState};
use crate::supervisor::LinkConfig;
use stim_types::{Packet, Subscribe};

pub(crate) const LISTENER: &str = "listener";
pub(crate) const SORTER: &str = "sorter";
pub(crate) const KEEPALIVE: &str = "keepalive";
pub(crate) const COMMANDER: &str = "commander";
pub(crate) const DETECTOR: &str = "detector";
pub(crate) const NOTIFIER: &str = "notifier";

/// How a task's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    /// Cooperative exit after a kill order.
    Completed,
    /// Repeated timeouts exhausted the task's retry budget.
    Timeout,
    /// An unrecoverable error; the supervisor should restart the group.
    Errored,
}

/// Exit notification delivered to the supervisor's monitor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskExit {
    pub name: &'static str,
    pub outcome: TaskOutcome,
}

/// The serial writer shared by commander, keepalive, and supervisor.
pub(crate) type SharedWriter = Arc<Mutex<Option<Box<dyn LinkPort>>>>;

/// Registered event subscribers, in subscription order.
pub(crate) type SubscriberList = Arc<RwLock<Vec<Arc<dyn Subscribe>>>>;

/// Everything a task needs, cheaply cloneable.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub session: Arc<SessionState>,
    pub queues: Arc<LinkQueues>,
    pub writer: SharedWriter,
    pub id_gen: Arc<PacketIdGen>,
    pub recorder: Arc<Mutex<SampleRecorder>>,
    pub subscribers: SubscriberList,
    pub exits: flume::Sender<TaskExit>,
    pub config: Arc<LinkConfig>,
}

impl TaskContext {
    pub fn report_exit(&self, name: &'static str, outcome: TaskOutcome) {
        // Best-effort: a full channel means the monitor already has plenty
        // of exits to react to.
        let _ = self.exits.try_send(TaskExit { name, outcome });
    }
}

/// Serialize and write a packet through the shared writer.
pub(crate) fn write_packet(writer: &SharedWriter, packet: &Packet) -> io::Result<()> {
    let mut guard = writer.lock().unwrap();
    match guard.as_mut() {
        Some(port) => port.write_frame(&packet.serialize()),
        None => Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "serial port is not open",
        )),
    }
}
