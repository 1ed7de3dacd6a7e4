//! In-memory device emulator.
//!
//! Backs the daemon's `--mock` flag and the integration tests: a pair of
//! byte channels stands in for the serial line, and a device-side thread
//! echoes transactions, streams synthetic samples, and can inject fault
//! responses.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info};

use crate::error::LinkError;
use crate::factory::PacketFactory;
use crate::port::{LinkPort, PortProvider, READ_TIMEOUT};
use stim_types::{
    DeviceFault, OpCode, Packet, PacketType, ADC_FULL_SCALE, ADC_OFFSET_UV, ADC_SCALE_UV,
};

/// One end of an in-memory byte pipe.
pub struct MockPort {
    tx: Sender<u8>,
    rx: Receiver<u8>,
    read_timeout: Duration,
}

impl MockPort {
    fn clone_handle(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            read_timeout: self.read_timeout,
        }
    }
}

/// Create a connected host/device port pair.
pub fn duplex() -> (MockPort, MockPort) {
    let (host_tx, device_rx) = unbounded();
    let (device_tx, host_rx) = unbounded();
    (
        MockPort {
            tx: host_tx,
            rx: host_rx,
            read_timeout: READ_TIMEOUT,
        },
        MockPort {
            tx: device_tx,
            rx: device_rx,
            read_timeout: READ_TIMEOUT,
        },
    )
}

impl LinkPort for MockPort {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.rx.recv_timeout(self.read_timeout) {
            Ok(byte) => {
                buf[0] = byte;
                let mut filled = 1;
                while filled < buf.len() {
                    match self.rx.try_recv() {
                        Ok(byte) => {
                            buf[filled] = byte;
                            filled += 1;
                        }
                        Err(_) => break,
                    }
                }
                Ok(filled)
            }
            Err(RecvTimeoutError::Timeout) => Ok(0),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock peer disconnected",
            )),
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        for &byte in frame {
            self.tx.send(byte).map_err(|_| {
                io::Error::new(io::ErrorKind::BrokenPipe, "mock peer disconnected")
            })?;
        }
        Ok(())
    }

    fn discard_buffers(&mut self) -> io::Result<()> {
        while self.rx.try_recv().is_ok() {}
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn try_clone_port(&self) -> io::Result<Box<dyn LinkPort>> {
        Ok(Box::new(self.clone_handle()))
    }
}

/// Synthetic signal shapes the emulator can stream.
#[derive(Debug, Clone, Copy)]
pub enum MockSignal {
    /// Constant raw ADC code.
    Flat(u16),
    /// Seizure-like trace: a strong DC shift with a slow oscillation riding
    /// on it, periodic over one classifier window.
    Seizure,
}

impl MockSignal {
    fn raw(&self, n: u32) -> u16 {
        match self {
            MockSignal::Flat(code) => *code,
            MockSignal::Seizure => {
                let period = classifier::WINDOW_SIZE as f64;
                let phase = 2.0 * std::f64::consts::PI * 2.0 * ((n as usize % classifier::WINDOW_SIZE) as f64) / period;
                let microvolts = 420.0 + 85.0 * phase.cos();
                ((microvolts - ADC_OFFSET_UV) / ADC_SCALE_UV * ADC_FULL_SCALE).round() as u16
            }
        }
    }
}

/// Emulator behavior knobs.
#[derive(Debug, Clone)]
pub struct MockDeviceConfig {
    /// Spacing between synthetic stream samples.
    pub stream_interval: Duration,
    pub signal: MockSignal,
    /// When set, respond to transactions with this fault instead of the
    /// echo once `fault_after` echoes have been served.
    pub fault: Option<DeviceFault>,
    pub fault_after: u32,
}

impl Default for MockDeviceConfig {
    fn default() -> Self {
        Self {
            stream_interval: Duration::from_millis(2),
            signal: MockSignal::Flat(31_416),
            fault: None,
            fault_after: 0,
        }
    }
}

/// Per-opcode counts of transactions the emulator received.
#[derive(Debug, Default)]
pub struct MockCounters {
    pub initial: AtomicUsize,
    pub keepalive: AtomicUsize,
    pub start_stream: AtomicUsize,
    pub stop_stream: AtomicUsize,
    pub start_stim: AtomicUsize,
    pub stop_stim: AtomicUsize,
}

impl MockCounters {
    fn record(&self, op: OpCode) {
        let counter = match op {
            OpCode::Initial => &self.initial,
            OpCode::Keepalive => &self.keepalive,
            OpCode::StartStream => &self.start_stream,
            OpCode::StopStream => &self.stop_stream,
            OpCode::StartStim => &self.start_stim,
            OpCode::StopStim => &self.stop_stim,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self, op: OpCode) -> usize {
        match op {
            OpCode::Initial => self.initial.load(Ordering::SeqCst),
            OpCode::Keepalive => self.keepalive.load(Ordering::SeqCst),
            OpCode::StartStream => self.start_stream.load(Ordering::SeqCst),
            OpCode::StopStream => self.stop_stream.load(Ordering::SeqCst),
            OpCode::StartStim => self.start_stim.load(Ordering::SeqCst),
            OpCode::StopStim => self.stop_stim.load(Ordering::SeqCst),
        }
    }
}

/// A device emulator running on its own thread.
pub struct MockDevice {
    counters: Arc<MockCounters>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    host_template: MockPort,
}

impl MockDevice {
    pub fn spawn(config: MockDeviceConfig) -> Self {
        let (host, device) = duplex();
        let counters = Arc::new(MockCounters::default());
        let stop = Arc::new(AtomicBool::new(false));

        let thread_counters = Arc::clone(&counters);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("mock-device".into())
            .spawn(move || emulator_loop(device, config, thread_counters, thread_stop))
            .expect("spawn mock device thread");

        info!("mock device started");
        Self {
            counters,
            stop,
            handle: Some(handle),
            host_template: host,
        }
    }

    /// A fresh host-side handle onto the emulated line.
    pub fn host_port(&self) -> MockPort {
        self.host_template.clone_handle()
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn emulator_loop(
    device: MockPort,
    config: MockDeviceConfig,
    counters: Arc<MockCounters>,
    stop: Arc<AtomicBool>,
) {
    let mut factory = PacketFactory::new();
    let mut streaming = false;
    let mut echoes_served: u32 = 0;
    let mut sample_index: u32 = 0;
    let mut stream_id: u8 = 0;
    let mut last_emit = Instant::now();
    let tx = device.tx.clone();
    let rx = device.rx.clone();

    let send_frame = |frame: &[u8]| -> bool { frame.iter().all(|&b| tx.send(b).is_ok()) };

    while !stop.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(1)) {
            Ok(byte) => {
                factory.push_byte(byte);
                if factory.is_ready() {
                    let taken = std::mem::take(&mut factory).take();
                    if let Some(packet) = taken {
                        if packet.packet_type() == PacketType::Transaction {
                            if let Some(op) = packet.opcode() {
                                counters.record(op);
                                let fault_now = config
                                    .fault
                                    .filter(|_| echoes_served >= config.fault_after);
                                if let Some(fault) = fault_now {
                                    debug!("mock device: {:?} -> {:?}", op, fault);
                                    if let Ok(failure) = Packet::new(
                                        PacketType::Failure,
                                        packet.id(),
                                        vec![fault as u8],
                                    ) {
                                        if !send_frame(&failure.serialize()) {
                                            break;
                                        }
                                    }
                                } else {
                                    echoes_served += 1;
                                    if !send_frame(&packet.serialize()) {
                                        break;
                                    }
                                    match op {
                                        OpCode::StartStream => streaming = true,
                                        OpCode::StopStream => streaming = false,
                                        _ => {}
                                    }
                                }
                            }
                        }
                    }
                } else if factory.is_failed() {
                    factory = PacketFactory::new();
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if streaming && last_emit.elapsed() >= config.stream_interval {
            last_emit = Instant::now();
            let raw = config.signal.raw(sample_index);
            let mut payload = Vec::with_capacity(6);
            payload.extend_from_slice(&sample_index.to_le_bytes());
            payload.extend_from_slice(&raw.to_le_bytes());
            sample_index = sample_index.wrapping_add(1);
            stream_id = stream_id.wrapping_add(1);
            if let Ok(packet) = Packet::new(PacketType::Stream, stream_id, payload) {
                if !send_frame(&packet.serialize()) {
                    break;
                }
            }
        }
    }
    debug!("mock device stopped");
}

/// [`PortProvider`] handing out handles onto one emulated line.
pub struct MockPortProvider {
    template: MockPort,
}

impl MockPortProvider {
    pub fn new(port: MockPort) -> Self {
        Self { template: port }
    }
}

impl PortProvider for MockPortProvider {
    fn candidates(&self) -> Vec<String> {
        vec!["mock".to_string()]
    }

    fn open(&self, _path: &str) -> Result<Box<dyn LinkPort>, LinkError> {
        Ok(Box::new(self.template.clone_handle()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulator_echoes_the_handshake() {
        let device = MockDevice::spawn(MockDeviceConfig::default());
        let mut port = device.host_port();
        port.set_timeout(Duration::from_millis(500)).unwrap();

        let frame = Packet::transaction(OpCode::Initial, 0).serialize();
        port.write_frame(&frame).unwrap();

        let mut echo = vec![0u8; frame.len()];
        let mut filled = 0;
        while filled < echo.len() {
            let n = port.read_bytes(&mut echo[filled..]).unwrap();
            assert!(n > 0, "echo timed out");
            filled += n;
        }
        assert_eq!(echo, frame);
        assert_eq!(device.counters().get(OpCode::Initial), 1);
    }

    #[test]
    fn fault_injection_replaces_the_echo() {
        let device = MockDevice::spawn(MockDeviceConfig {
            fault: Some(DeviceFault::NotConnected),
            fault_after: 0,
            ..MockDeviceConfig::default()
        });
        let mut port = device.host_port();
        port.set_timeout(Duration::from_millis(500)).unwrap();

        port.write_frame(&Packet::transaction(OpCode::Keepalive, 3).serialize())
            .unwrap();

        let mut factory = PacketFactory::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        let packet = loop {
            assert!(Instant::now() < deadline, "no response from emulator");
            let mut byte = [0u8; 1];
            if port.read_bytes(&mut byte).unwrap() == 1 {
                factory.push_byte(byte[0]);
                if factory.is_ready() {
                    break std::mem::take(&mut factory).take().unwrap();
                }
            }
        };
        assert_eq!(packet.packet_type(), PacketType::Failure);
        assert_eq!(packet.fault(), Some(DeviceFault::NotConnected));
    }
}
