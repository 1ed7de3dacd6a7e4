//! Serial transport abstraction.
//!
//! The link talks to the device through the [`LinkPort`] trait so the mock
//! device and the real `serialport` backend are interchangeable. The
//! supervisor is the only component that opens or closes ports; the
//! listener owns a cloned reader handle while writers share a mutex.

use std::io;
use std::time::Duration;

use log::warn;
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use crate::error::LinkError;
use stim_types::MAX_TIMEOUT_MS;

/// Line settings for the device link: 115200 8N1.
pub const BAUD_RATE: u32 = 115_200;

/// Serial read timeout.
pub const READ_TIMEOUT: Duration = Duration::from_millis(MAX_TIMEOUT_MS);

/// Serial write deadline.
pub const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Byte-level serial transport.
pub trait LinkPort: Send {
    /// Read up to `buf.len()` bytes; returns `Ok(0)` when the read timed
    /// out with nothing available.
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write a complete frame and flush it.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Drop any bytes pending in the input and output buffers.
    fn discard_buffers(&mut self) -> io::Result<()>;

    /// Adjust the per-handle operation timeout.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Clone the underlying handle; clones keep independent timeouts.
    fn try_clone_port(&self) -> io::Result<Box<dyn LinkPort>>;
}

/// Opens and enumerates candidate ports for the supervisor.
pub trait PortProvider: Send + Sync {
    /// Candidate device paths in probe order.
    fn candidates(&self) -> Vec<String>;

    /// Open a candidate with the link line settings and read timeout.
    fn open(&self, path: &str) -> Result<Box<dyn LinkPort>, LinkError>;
}

/// A real serial port handle.
pub struct SerialLink {
    inner: Box<dyn SerialPort>,
}

impl LinkPort for SerialLink {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.inner.write_all(frame)?;
        self.inner.flush()
    }

    fn discard_buffers(&mut self) -> io::Result<()> {
        self.inner
            .clear(ClearBuffer::All)
            .map_err(io::Error::from)
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.inner.set_timeout(timeout).map_err(io::Error::from)
    }

    fn try_clone_port(&self) -> io::Result<Box<dyn LinkPort>> {
        let clone = self.inner.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(SerialLink { inner: clone }))
    }
}

/// Enumerates real serial devices via the `serialport` crate.
pub struct SystemPorts {
    preferred: Option<String>,
}

impl SystemPorts {
    /// With `preferred` set, only that path is probed.
    pub fn new(preferred: Option<String>) -> Self {
        Self { preferred }
    }
}

impl PortProvider for SystemPorts {
    fn candidates(&self) -> Vec<String> {
        if let Some(path) = &self.preferred {
            return vec![path.clone()];
        }
        match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                warn!("serial port enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    fn open(&self, path: &str) -> Result<Box<dyn LinkPort>, LinkError> {
        let inner = serialport::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(io::Error::from)?;
        Ok(Box::new(SerialLink { inner }))
    }
}
