//! Rolling CSV sample log.
//!
//! One file per recording session, named `YYYYMMDD-HHMMSS-N.csv`; the
//! index `N` increments whenever the current file grows past the size cap.
//! Opened on a StartStream acknowledgement, closed on the StopStream
//! acknowledgement and on shutdown.

use std::fs::{create_dir_all, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Local;
use log::{info, warn};

/// Rotate once a file exceeds this many bytes.
pub const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;

/// One row of the sample log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamRecord {
    pub device_timestamp: u32,
    pub microvolts: f64,
    pub seizure_detected: bool,
    pub therapy_on: bool,
}

struct ActiveFile {
    writer: BufWriter<File>,
    path: PathBuf,
    base: String,
    index: u32,
    bytes: u64,
}

/// Buffered, rotating CSV writer for stream samples.
pub struct SampleRecorder {
    dir: PathBuf,
    debug_format: bool,
    max_file_bytes: u64,
    active: Option<ActiveFile>,
}

impl SampleRecorder {
    /// `debug_format` prepends a host timestamp (milliseconds since epoch)
    /// to every record.
    pub fn new(dir: impl AsRef<Path>, debug_format: bool) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            debug_format,
            max_file_bytes: MAX_FILE_BYTES,
            active: None,
        }
    }

    /// Override the rotation threshold (tests).
    pub fn max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    /// Begin a new recording session. A session already in progress is kept.
    pub fn open(&mut self) -> io::Result<()> {
        if self.active.is_some() {
            return Ok(());
        }
        create_dir_all(&self.dir)?;
        let base = Local::now().format("%Y%m%d-%H%M%S").to_string();
        self.active = Some(Self::create_file(&self.dir, base, 0)?);
        Ok(())
    }

    /// Flush and close the current session, if any.
    pub fn close(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Err(e) = active.writer.flush() {
                warn!("sample log flush failed on close: {}", e);
            }
            info!("sample log closed: {}", active.path.display());
        }
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// Path of the file currently being written.
    pub fn current_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    /// Append one record; a no-op while no session is open.
    pub fn record(&mut self, record: &StreamRecord) -> io::Result<()> {
        let debug_format = self.debug_format;
        let max_bytes = self.max_file_bytes;
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };

        let line = if debug_format {
            let host_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            format!(
                "{},{},{},{},{}",
                host_ms,
                record.device_timestamp,
                record.microvolts,
                record.seizure_detected,
                record.therapy_on
            )
        } else {
            format!(
                "{},{},{},{}",
                record.device_timestamp,
                record.microvolts,
                record.seizure_detected,
                record.therapy_on
            )
        };
        writeln!(active.writer, "{}", line)?;
        active.bytes += line.len() as u64 + 1;

        if active.bytes > max_bytes {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };
        active.writer.flush()?;
        let next = Self::create_file(&self.dir, active.base.clone(), active.index + 1)?;
        info!(
            "sample log rotated: {} -> {}",
            active.path.display(),
            next.path.display()
        );
        self.active = Some(next);
        Ok(())
    }

    fn create_file(dir: &Path, base: String, index: u32) -> io::Result<ActiveFile> {
        let path = dir.join(format!("{}-{}.csv", base, index));
        let file = File::create(&path)?;
        info!("sample log opened: {}", path.display());
        Ok(ActiveFile {
            writer: BufWriter::new(file),
            path,
            base,
            index,
            bytes: 0,
        })
    }
}

impl Drop for SampleRecorder {
    fn drop(&mut self) {
        self.close();
    }
}
