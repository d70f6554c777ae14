//! Serial device backend
//!
//! Owns the character device: advisory lock acquisition, open with raw
//! 8-N-1 termios at a configured baud, runtime baud changes, BREAK, and
//! byte-level I/O bridged to the async core.
//!
//! Uses blocking threads for the actual port I/O:
//! - Reader thread: reads from the port with a small timeout, sends chunks
//!   to a channel, exits on shutdown or when the device goes away
//! - Writer thread: receives from a channel, writes to the port
//!
//! The device lifecycle is driven entirely by the session multiplexer:
//! opened when the first client connects, closed when the last one leaves.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::constants::{
    BREAK_DURATION_MS, CHANNEL_CAPACITY, READ_CHUNK, SERIAL_READ_TIMEOUT_MS, SUPPORTED_BAUDS,
};
use crate::error::{Error, Result};
use crate::lockfile::LockDir;

/// Channels for bidirectional communication with an open device.
///
/// The backend owns the underlying port and its I/O threads; when the
/// device disappears the `rx` side closes, which the multiplexer treats
/// as a fatal session event.
pub struct DeviceChannels {
    /// Chunks read from the device
    pub rx: mpsc::Receiver<Bytes>,
    /// Bytes to write to the device
    pub tx: mpsc::Sender<Bytes>,
}

/// The device seam between the multiplexer and the hardware.
///
/// `open`/`close` are invoked exactly on the 0→1 / 1→0 client-count
/// transitions; `set_baud` and `send_break` require an open device.
pub trait DeviceBackend: Send {
    fn open(&mut self, baud: u32) -> Result<DeviceChannels>;
    fn set_baud(&mut self, baud: u32) -> Result<()>;
    fn send_break(&mut self) -> Result<()>;
    fn close(&mut self);
}

/// Validate a baud rate against the supported discrete set
pub fn discrete_baud(baud: u32) -> Result<u32> {
    if SUPPORTED_BAUDS.contains(&baud) {
        Ok(baud)
    } else {
        Err(Error::UnsupportedBaud { baud })
    }
}

/// Real serial device behind the `DeviceBackend` seam
pub struct SerialBackend {
    path: PathBuf,
    locks: LockDir,
    control: Option<Box<dyn serialport::SerialPort>>,
    shutdown: Arc<AtomicBool>,
}

impl SerialBackend {
    pub fn new(path: impl Into<PathBuf>, locks: LockDir) -> Self {
        Self {
            path: path.into(),
            locks,
            control: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn open_port(&self, baud: u32) -> Result<Box<dyn serialport::SerialPort>> {
        serialport::new(self.path.to_string_lossy(), baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(SERIAL_READ_TIMEOUT_MS))
            .open()
            .map_err(|e| Error::DeviceOpen {
                path: self.path.clone(),
                source: std::io::Error::other(e.to_string()),
            })
    }

    fn clone_port(&self, port: &dyn serialport::SerialPort) -> Result<Box<dyn serialport::SerialPort>> {
        port.try_clone().map_err(|e| Error::DeviceOpen {
            path: self.path.clone(),
            source: std::io::Error::other(e.to_string()),
        })
    }
}

impl DeviceBackend for SerialBackend {
    fn open(&mut self, baud: u32) -> Result<DeviceChannels> {
        discrete_baud(baud)?;
        self.locks.lock(&self.path)?;

        // Release the lock on any failure past this point: the lockfile
        // must exist iff this process owns the device.
        let opened = self.open_port(baud).and_then(|port| {
            let reader = self.clone_port(port.as_ref())?;
            let writer = self.clone_port(port.as_ref())?;
            Ok((port, reader, writer))
        });
        let (port, mut reader, mut writer) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                self.locks.unlock(&self.path);
                return Err(e);
            }
        };

        let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        // Reader thread (blocking)
        let shutdown_reader = shutdown.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            while !shutdown_reader.load(Ordering::Relaxed) {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if in_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
        });

        // Writer thread (blocking)
        let shutdown_writer = shutdown.clone();
        std::thread::spawn(move || {
            while let Some(data) = out_rx.blocking_recv() {
                if shutdown_writer.load(Ordering::Relaxed) {
                    break;
                }
                if writer.write_all(&data).is_err() {
                    break;
                }
            }
        });

        self.control = Some(port);
        self.shutdown = shutdown;
        tracing::info!("OPENED: {}", self.path.display());

        Ok(DeviceChannels {
            rx: in_rx,
            tx: out_tx,
        })
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        let baud = discrete_baud(baud)?;
        let port = self.control.as_mut().ok_or(Error::DeviceNotOpen)?;
        port.set_baud_rate(baud).map_err(|e| Error::Serial {
            source: std::io::Error::other(e.to_string()),
        })
    }

    fn send_break(&mut self) -> Result<()> {
        let port = self.control.as_ref().ok_or(Error::DeviceNotOpen)?;
        let map = |e: serialport::Error| Error::Serial {
            source: std::io::Error::other(e.to_string()),
        };
        port.set_break().map_err(map)?;
        std::thread::sleep(Duration::from_millis(BREAK_DURATION_MS));
        port.clear_break().map_err(map)
    }

    fn close(&mut self) {
        if self.control.take().is_some() {
            self.shutdown.store(true, Ordering::Relaxed);
            self.locks.unlock(&self.path);
            tracing::info!("CLOSED: {}", self.path.display());
        }
    }
}

impl Drop for SerialBackend {
    fn drop(&mut self) {
        self.close();
    }
}
