//! Centralized error types for the concentrator
//!
//! All errors are represented by the `Error` enum.
//! Use `Result<T>` as shorthand for `std::result::Result<T, Error>`.

use std::fmt;
use std::path::PathBuf;

/// All concentrator errors
#[derive(Debug)]
pub enum Error {
    // === Network ===
    /// Failed to create/bind/listen on the TCP socket
    Bind { port: u16, source: std::io::Error },

    // === Device ===
    /// Device not accessible for read+write at startup pre-flight
    DevicePreflight { path: PathBuf },
    /// Another process holds the advisory lock on the device
    DeviceLocked { path: PathBuf },
    /// Failed to open or clone the serial device
    DeviceOpen {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Operation requires an open device but none is open
    DeviceNotOpen,
    /// Termios-level operation on the open device failed
    Serial { source: std::io::Error },
    /// Baud rate outside the supported discrete set
    UnsupportedBaud { baud: u32 },

    // === Locking ===
    /// Filesystem error manipulating the lockfile
    Lockfile {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Config ===
    /// Failed to read the config file
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Invalid config value
    ConfigValidation { field: &'static str, reason: String },
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. }
            | Self::DeviceOpen { source, .. }
            | Self::Serial { source }
            | Self::Lockfile { source, .. }
            | Self::ConfigRead { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { port, source } => write!(f, "cannot bind TCP port {}: {}", port, source),
            Self::DevicePreflight { path } => {
                write!(f, "cannot access {} for read+write", path.display())
            }
            Self::DeviceLocked { path } => write!(f, "device {} is locked", path.display()),
            Self::DeviceOpen { path, source } => {
                write!(f, "cannot open device {}: {}", path.display(), source)
            }
            Self::DeviceNotOpen => write!(f, "serial device is not open"),
            Self::Serial { source } => write!(f, "serial port operation failed: {}", source),
            Self::UnsupportedBaud { baud } => write!(f, "unsupported baud rate: {}", baud),
            Self::Lockfile { path, source } => {
                write!(f, "lockfile error at {}: {}", path.display(), source)
            }
            Self::ConfigRead { path, source } => {
                write!(f, "cannot read config {}: {}", path.display(), source)
            }
            Self::ConfigValidation { field, reason } => {
                write!(f, "invalid {}: {}", field, reason)
            }
        }
    }
}

/// Alias for Result with the crate error type
pub type Result<T> = std::result::Result<T, Error>;
