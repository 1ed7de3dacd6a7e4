//! Link lifecycle supervision.
//!
//! The supervisor owns the serial port, the session state, and the task
//! group. It runs the connect handshake, spawns the six runtime tasks, and
//! restarts the group whenever any task exits. Stopping wins over
//! restarting: a restart request observed while stopping is ignored.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::commands::CommandGate;
use crate::error::{CommandRefused, LinkError};
use crate::port::{LinkPort, PortProvider};
use crate::queues::LinkQueues;
use crate::recorder::SampleRecorder;
use crate::registry::{TaskBag, TaskEntry};
use crate::session::{LinkStatus, PacketIdGen, SessionState};
use crate::tasks::{self, SharedWriter, SubscriberList, TaskContext, TaskExit};
use stim_types::{OpCode, Packet, Subscribe, MAX_TIMEOUT_MS, MIN_TIMEOUT_MS};

/// Handshake attempts before giving up on a port.
const HANDSHAKE_ATTEMPTS: u32 = 3;

/// Timeouts and periods governing the link.
#[derive(Debug, Clone)]
pub struct LinkTiming {
    /// Serial read timeout.
    pub read_timeout: Duration,
    /// Serial write deadline.
    pub write_timeout: Duration,
    /// Keepalive emission period.
    pub keepalive_period: Duration,
    /// Idle sleep between queue polls.
    pub idle_sleep: Duration,
    /// How long the supervisor waits for killed tasks to drain.
    pub kill_timeout: Duration,
    /// Device-side quiescence delay before a reconnect handshake.
    pub reconnect_quiescence: Duration,
    /// Backoff between handshake attempts after a read timeout.
    pub handshake_backoff: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(MAX_TIMEOUT_MS),
            write_timeout: Duration::from_millis(500),
            keepalive_period: Duration::from_millis(MAX_TIMEOUT_MS),
            idle_sleep: Duration::from_millis(MIN_TIMEOUT_MS),
            kill_timeout: Duration::from_millis(MAX_TIMEOUT_MS / 10),
            reconnect_quiescence: Duration::from_secs(3),
            handshake_backoff: Duration::from_secs(1),
        }
    }
}

/// Link runtime configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Directory receiving the rolling CSV sample logs.
    pub csv_dir: PathBuf,
    /// Prepend a host timestamp to every CSV record.
    pub csv_debug_format: bool,
    /// New samples required between classifications.
    pub predict_rate: u32,
    /// Classification history folded into the confidence value.
    pub prediction_history: usize,
    pub timing: LinkTiming,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            csv_dir: PathBuf::from("./recordings"),
            csv_debug_format: false,
            predict_rate: classifier::DEFAULT_SAMPLE_RATE,
            prediction_history: classifier::DEFAULT_PREDICTION_CAPACITY,
            timing: LinkTiming::default(),
        }
    }
}

impl LinkConfig {
    /// Protocol-default behavior with timings shortened for tests.
    pub fn fast_test() -> Self {
        Self {
            csv_dir: std::env::temp_dir().join("stim-link-tests"),
            timing: LinkTiming {
                read_timeout: Duration::from_millis(100),
                write_timeout: Duration::from_millis(100),
                keepalive_period: Duration::from_millis(50),
                idle_sleep: Duration::from_millis(10),
                kill_timeout: Duration::from_millis(200),
                reconnect_quiescence: Duration::from_millis(50),
                handshake_backoff: Duration::from_millis(50),
            },
            ..Self::default()
        }
    }
}

struct MonitorHandle {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Owner of the port, the session, and the task group.
pub struct LinkSupervisor {
    config: Arc<LinkConfig>,
    ports: Arc<dyn PortProvider>,
    session: Arc<SessionState>,
    queues: Arc<LinkQueues>,
    id_gen: Arc<PacketIdGen>,
    writer: SharedWriter,
    reader: Mutex<Option<Box<dyn LinkPort>>>,
    recorder: Arc<Mutex<SampleRecorder>>,
    subscribers: SubscriberList,
    tasks: TaskBag,
    exit_tx: flume::Sender<TaskExit>,
    exit_rx: flume::Receiver<TaskExit>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl LinkSupervisor {
    pub fn new(config: LinkConfig, ports: Arc<dyn PortProvider>) -> Arc<Self> {
        let (exit_tx, exit_rx) = flume::bounded(16);
        let recorder = SampleRecorder::new(&config.csv_dir, config.csv_debug_format);
        Arc::new(Self {
            config: Arc::new(config),
            ports,
            session: Arc::new(SessionState::new()),
            queues: Arc::new(LinkQueues::new()),
            id_gen: Arc::new(PacketIdGen::new()),
            writer: Arc::new(Mutex::new(None)),
            reader: Mutex::new(None),
            recorder: Arc::new(Mutex::new(recorder)),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            tasks: TaskBag::new(),
            exit_tx,
            exit_rx,
            monitor: Mutex::new(None),
        })
    }

    /// Bring the link up: probe ports, handshake, spawn the task group.
    pub async fn start(self: &Arc<Self>) -> Result<(), LinkError> {
        // A stale group from a previous run is torn down first.
        self.cancel_monitor();
        self.tasks.kill_all();
        self.tasks.wait_drained(self.config.timing.kill_timeout).await;
        self.tasks.clear();
        self.close_port();
        self.queues.clear_all();
        while self.exit_rx.try_recv().is_ok() {}

        let this = Arc::clone(self);
        let connected = tokio::task::spawn_blocking(move || this.connect_blocking())
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if let Err(e) = connected {
            self.session.set_status(LinkStatus::Error);
            return Err(e);
        }

        self.spawn_tasks();
        self.spawn_monitor();
        self.session.set_status(LinkStatus::Running);
        info!("link running");

        if self.session.user_streaming() {
            self.session.set_start_stream_sent(false);
            if let Err(refused) = self.gate().start_streaming() {
                debug!("stream resume refused: {}", refused);
            }
        }
        Ok(())
    }

    /// Tear the link down and return to `Created`.
    pub async fn stop(self: &Arc<Self>) {
        info!("stopping link");
        if self.session.is_streaming() {
            if let Err(refused) = self.gate().stop_streaming() {
                debug!("stream stop refused: {}", refused);
            }
            // Give the commander a moment to get the StopStream out.
            tokio::time::sleep(self.config.timing.kill_timeout).await;
        }
        self.session.set_status(LinkStatus::Stopping);
        self.cancel_monitor();
        self.tasks.kill_all();
        if !self.tasks.wait_drained(self.config.timing.kill_timeout).await {
            warn!(
                "tasks did not drain within {:?}",
                self.config.timing.kill_timeout
            );
        }
        self.tasks.clear();
        self.close_port();
        if let Ok(mut recorder) = self.recorder.lock() {
            recorder.close();
        }
        self.queues.clear_all();
        self.session.set_status(LinkStatus::Created);
        info!("link stopped");
    }

    pub fn start_streaming(&self) -> Result<(), CommandRefused> {
        self.gate().start_streaming()
    }

    pub fn stop_streaming(&self) -> Result<(), CommandRefused> {
        self.gate().stop_streaming()
    }

    pub fn start_therapy(&self) -> Result<(), CommandRefused> {
        self.gate().start_therapy()
    }

    pub fn stop_therapy(&self) -> Result<(), CommandRefused> {
        self.gate().stop_therapy()
    }

    /// Register a subscriber for stream and lifecycle events.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscribe>) {
        self.subscribers.write().unwrap().push(subscriber);
    }

    pub fn status(&self) -> LinkStatus {
        self.session.status()
    }

    pub fn is_running(&self) -> bool {
        self.session.status() == LinkStatus::Running
    }

    pub fn is_streaming(&self) -> bool {
        self.session.is_streaming()
    }

    pub fn is_stimming(&self) -> bool {
        self.session.is_stimming()
    }

    fn gate(&self) -> CommandGate {
        CommandGate::new(Arc::clone(&self.session), Arc::clone(&self.queues))
    }

    fn close_port(&self) {
        *self.writer.lock().unwrap() = None;
        *self.reader.lock().unwrap() = None;
    }

    /// Probe every candidate port until one completes the handshake.
    fn connect_blocking(&self) -> Result<(), LinkError> {
        let candidates = self.ports.candidates();
        if candidates.is_empty() {
            error!("no serial ports found");
            return Err(LinkError::NoPortAvailable);
        }
        for path in candidates {
            info!("probing serial port {}", path);
            let mut port = match self.ports.open(&path) {
                Ok(port) => port,
                Err(e) => {
                    warn!("unable to open {}: {}", path, e);
                    continue;
                }
            };
            self.session.set_status(LinkStatus::Opened);
            if let Err(e) = port.set_timeout(self.config.timing.read_timeout) {
                warn!("unable to configure {}: {}", path, e);
                continue;
            }
            if let Err(e) = port.discard_buffers() {
                warn!("unable to flush {}: {}", path, e);
            }
            let mut reader = match port.try_clone_port() {
                Ok(reader) => reader,
                Err(e) => {
                    warn!("unable to clone {}: {}", path, e);
                    continue;
                }
            };
            let mut writer = port;
            if let Err(e) = writer.set_timeout(self.config.timing.write_timeout) {
                warn!("unable to configure {}: {}", path, e);
                continue;
            }

            match self.send_connect(&mut *writer, &mut *reader) {
                Ok(()) => {
                    *self.writer.lock().unwrap() = Some(writer);
                    *self.reader.lock().unwrap() = Some(reader);
                    self.session.set_status(LinkStatus::Connected);
                    info!("device connected on {}", path);
                    return Ok(());
                }
                Err(LinkError::Io(e)) => {
                    // A hard I/O failure during the handshake is not retried
                    // on other ports either.
                    error!("handshake I/O failure on {}: {}", path, e);
                    self.session.set_status(LinkStatus::Created);
                    return Err(LinkError::Io(e));
                }
                Err(e) => {
                    warn!("handshake failed on {}: {}", path, e);
                    self.session.set_status(LinkStatus::Created);
                }
            }
        }
        Err(LinkError::NoPortAvailable)
    }

    /// Synchronous connect handshake: the device must echo the Initial
    /// transaction byte-exactly.
    fn send_connect(
        &self,
        writer: &mut dyn LinkPort,
        reader: &mut dyn LinkPort,
    ) -> Result<(), LinkError> {
        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            let packet = Packet::transaction(OpCode::Initial, self.id_gen.next());
            let frame = packet.serialize();
            if let Err(e) = writer.write_frame(&frame) {
                if e.kind() == io::ErrorKind::TimedOut {
                    warn!("handshake write timed out (attempt {})", attempt);
                    std::thread::sleep(self.config.timing.handshake_backoff);
                    continue;
                }
                return Err(e.into());
            }

            let mut echo = vec![0u8; frame.len()];
            match read_exact_frame(reader, &mut echo) {
                Ok(true) if echo == frame => return Ok(()),
                Ok(true) => warn!("handshake echo mismatch (attempt {})", attempt),
                Ok(false) => {
                    warn!("handshake read timed out (attempt {})", attempt);
                    std::thread::sleep(self.config.timing.handshake_backoff);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LinkError::HandshakeFailed {
            attempts: HANDSHAKE_ATTEMPTS,
        })
    }

    /// Re-handshake over the already-open port after a restart.
    fn handshake_existing(&self) -> Result<(), LinkError> {
        let mut guard = self.writer.lock().unwrap();
        let writer = guard.as_mut().ok_or(LinkError::PortClosed)?;
        let mut reader = writer.try_clone_port()?;
        reader.set_timeout(self.config.timing.read_timeout)?;
        let _ = writer.discard_buffers();
        self.send_connect(&mut **writer, &mut *reader)?;
        drop(guard);
        *self.reader.lock().unwrap() = Some(reader);
        Ok(())
    }

    fn spawn_tasks(self: &Arc<Self>) {
        let reader = self.reader.lock().unwrap().take();
        match reader {
            Some(reader) => {
                let cancel = CancellationToken::new();
                let ctx = self.task_context();
                let token = cancel.clone();
                match std::thread::Builder::new()
                    .name("listener".into())
                    .spawn(move || tasks::listener::run(reader, ctx, token))
                {
                    Ok(handle) => self
                        .tasks
                        .try_add(tasks::LISTENER, TaskEntry::thread(cancel, handle)),
                    Err(e) => error!("unable to spawn the listener thread: {}", e),
                }
            }
            None => error!("no reader handle available for the listener"),
        }

        self.add_async_task(tasks::SORTER, tasks::sorter::run);
        self.add_async_task(tasks::KEEPALIVE, tasks::keepalive::run);
        self.add_async_task(tasks::COMMANDER, tasks::commander::run);
        self.add_async_task(tasks::DETECTOR, tasks::detector::run);
        self.add_async_task(tasks::NOTIFIER, tasks::notifier::run);
    }

    fn add_async_task<F, Fut>(&self, name: &'static str, task: F)
    where
        F: FnOnce(TaskContext, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(self.task_context(), cancel.clone()));
        self.tasks.try_add(name, TaskEntry::tokio(cancel, handle));
    }

    fn task_context(&self) -> TaskContext {
        TaskContext {
            session: Arc::clone(&self.session),
            queues: Arc::clone(&self.queues),
            writer: Arc::clone(&self.writer),
            id_gen: Arc::clone(&self.id_gen),
            recorder: Arc::clone(&self.recorder),
            subscribers: Arc::clone(&self.subscribers),
            exits: self.exit_tx.clone(),
            config: Arc::clone(&self.config),
        }
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let mut guard = self.monitor.lock().unwrap();
        if let Some(existing) = guard.as_ref() {
            if !existing.handle.is_finished() {
                return;
            }
        }
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { this.monitor_loop(token).await });
        *guard = Some(MonitorHandle { cancel, handle });
    }

    fn cancel_monitor(&self) {
        if let Some(monitor) = self.monitor.lock().unwrap().take() {
            monitor.cancel.cancel();
        }
    }

    /// Watches for any task exit and restarts the group.
    async fn monitor_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let exit = tokio::select! {
                _ = cancel.cancelled() => break,
                exit = self.exit_rx.recv_async() => match exit {
                    Ok(exit) => exit,
                    Err(_) => break,
                },
            };
            warn!("task '{}' exited: {:?}", exit.name, exit.outcome);
            self.tasks.health_check();
            match self.session.status() {
                LinkStatus::Stopping | LinkStatus::Created | LinkStatus::Error => continue,
                _ => {}
            }
            self.reconnect().await;
            // Exits produced by the kill order are stale now.
            while self.exit_rx.try_recv().is_ok() {}
        }
    }

    /// Kill the group, wait for device quiescence, re-handshake, respawn.
    async fn reconnect(self: &Arc<Self>) {
        if self.session.status() == LinkStatus::Stopping {
            return;
        }
        info!("restarting the link");
        self.session.set_status(LinkStatus::Restart);
        self.tasks.kill_all();
        if !self.tasks.wait_drained(self.config.timing.kill_timeout).await {
            warn!(
                "tasks did not drain within {:?}",
                self.config.timing.kill_timeout
            );
        }
        self.tasks.clear();
        self.queues.clear_all();
        self.session.reset_for_reconnect();

        tokio::time::sleep(self.config.timing.reconnect_quiescence).await;
        if self.session.status() == LinkStatus::Stopping {
            return;
        }

        let this = Arc::clone(self);
        let handshake = tokio::task::spawn_blocking(move || this.handshake_existing()).await;
        match handshake {
            Ok(Ok(())) => {
                if self.session.status() == LinkStatus::Stopping {
                    return;
                }
                self.spawn_tasks();
                self.session.set_status(LinkStatus::Running);
                info!("link restarted");
                if self.session.user_streaming() {
                    if let Err(refused) = self.gate().start_streaming() {
                        debug!("stream resume refused: {}", refused);
                    }
                }
            }
            Ok(Err(e)) => {
                error!("reconnect failed: {}", e);
                self.session.set_status(LinkStatus::Error);
            }
            Err(e) => {
                error!("reconnect task failed: {}", e);
                self.session.set_status(LinkStatus::Error);
            }
        }
    }
}

/// Fill `buf` from the port, retrying short reads.
///
/// Returns `Ok(false)` when a read times out before the buffer fills.
fn read_exact_frame(port: &mut dyn LinkPort, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match port.read_bytes(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
