//! Registry of running link tasks.
//!
//! The supervisor parks every spawned task here by name. Adding a task
//! under a name that is already present evicts the prior task (cancelling
//! it first); a health check sweeps out entries whose task has finished.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::warn;
use tokio_util::sync::CancellationToken;

/// Join handle for either flavor of task.
pub enum TaskHandle {
    Tokio(tokio::task::JoinHandle<()>),
    Thread(thread::JoinHandle<()>),
}

impl TaskHandle {
    fn is_finished(&self) -> bool {
        match self {
            TaskHandle::Tokio(handle) => handle.is_finished(),
            TaskHandle::Thread(handle) => handle.is_finished(),
        }
    }
}

/// A registered task: its kill switch plus its join handle.
pub struct TaskEntry {
    cancel: CancellationToken,
    handle: TaskHandle,
}

impl TaskEntry {
    pub fn tokio(cancel: CancellationToken, handle: tokio::task::JoinHandle<()>) -> Self {
        Self {
            cancel,
            handle: TaskHandle::Tokio(handle),
        }
    }

    pub fn thread(cancel: CancellationToken, handle: thread::JoinHandle<()>) -> Self {
        Self {
            cancel,
            handle: TaskHandle::Thread(handle),
        }
    }
}

/// Concurrent name → task map.
#[derive(Default)]
pub struct TaskBag {
    tasks: Mutex<HashMap<&'static str, TaskEntry>>,
}

impl TaskBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task, evicting and cancelling any prior task of the same
    /// name.
    pub fn try_add(&self, name: &'static str, entry: TaskEntry) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(prior) = tasks.insert(name, entry) {
            warn!("task '{}' replaced while still registered", name);
            prior.cancel.cancel();
        }
    }

    /// Signal every registered task to stop.
    pub fn kill_all(&self) {
        let tasks = self.tasks.lock().unwrap();
        for entry in tasks.values() {
            entry.cancel.cancel();
        }
    }

    /// Wait until every registered task has finished, up to `deadline`.
    ///
    /// Returns `false` when the deadline elapsed with tasks still running.
    pub async fn wait_drained(&self, deadline: Duration) -> bool {
        let start = std::time::Instant::now();
        loop {
            if self.all_finished() {
                return true;
            }
            if start.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn all_finished(&self) -> bool {
        let tasks = self.tasks.lock().unwrap();
        tasks.values().all(|entry| entry.handle.is_finished())
    }

    /// Drop entries whose task has exited.
    pub fn health_check(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|name, entry| {
            let alive = !entry.handle.is_finished();
            if !alive {
                warn!("task '{}' removed from registry after exit", name);
            }
            alive
        });
    }

    /// Forget every entry (tasks must already be stopped or detached).
    pub fn clear(&self) {
        self.tasks.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }
}
