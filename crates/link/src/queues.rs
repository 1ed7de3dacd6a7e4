//! Bounded lock-free queues between the link tasks.
//!
//! Every queue is a crossbeam `ArrayQueue` behind try-only operations: no
//! task ever blocks on a queue. A full queue drops the value with a warning.

use crossbeam_queue::ArrayQueue;
use log::warn;

use stim_types::{OpCode, Packet, StreamSample};

const INBOUND_CAPACITY: usize = 256;
const KEEPALIVE_CAPACITY: usize = 8;
const CMD_RESP_CAPACITY: usize = 16;
const STREAM_CAPACITY: usize = 512;
const COMMANDS_CAPACITY: usize = 32;
const CLIENT_EVENTS_CAPACITY: usize = 256;

/// A named bounded MPMC queue with non-blocking operations.
pub struct BoundedQueue<T> {
    name: &'static str,
    inner: ArrayQueue<T>,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            inner: ArrayQueue::new(capacity),
        }
    }

    /// Push without blocking; a full queue drops the value.
    pub fn try_push(&self, value: T) -> bool {
        match self.inner.push(value) {
            Ok(()) => true,
            Err(_) => {
                warn!("{} queue full, dropping", self.name);
                false
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Drain every queued value.
    pub fn clear(&self) {
        while self.inner.pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

/// The full set of inter-task queues.
pub struct LinkQueues {
    /// Validated inbound packets (listener → sorter).
    pub inbound: BoundedQueue<Packet>,
    /// Keepalive responses (sorter → keepalive).
    pub keepalive: BoundedQueue<Packet>,
    /// Command responses (sorter → commander).
    pub cmd_resp: BoundedQueue<Packet>,
    /// Decoded stream samples (sorter → detector).
    pub stream: BoundedQueue<StreamSample>,
    /// Outbound opcodes (public API / detector → commander).
    pub commands: BoundedQueue<OpCode>,
    /// Packets whose arrival is announced to subscribers (sorter → notifier).
    pub client_events: BoundedQueue<Packet>,
}

impl LinkQueues {
    pub fn new() -> Self {
        Self {
            inbound: BoundedQueue::new("inbound", INBOUND_CAPACITY),
            keepalive: BoundedQueue::new("keepalive", KEEPALIVE_CAPACITY),
            cmd_resp: BoundedQueue::new("cmd-resp", CMD_RESP_CAPACITY),
            stream: BoundedQueue::new("stream", STREAM_CAPACITY),
            commands: BoundedQueue::new("commands", COMMANDS_CAPACITY),
            client_events: BoundedQueue::new("client-events", CLIENT_EVENTS_CAPACITY),
        }
    }

    /// Drop everything currently queued, on every queue.
    pub fn clear_all(&self) {
        self.inbound.clear();
        self.keepalive.clear();
        self.cmd_resp.clear();
        self.stream.clear();
        self.commands.clear();
        self.client_events.clear();
    }
}

impl Default for LinkQueues {
    fn default() -> Self {
        Self::new()
    }
}
