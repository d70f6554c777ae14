//! Application-wide constants
//!
//! Centralized constants to avoid duplication and ensure consistency.

// =============================================================================
// Network
// =============================================================================

/// Default TCP listen port for the concentrator
pub const DEFAULT_TCP_PORT: u16 = 2300;

/// Listen backlog for the concentrator socket
pub const LISTEN_BACKLOG: i32 = 8;

// =============================================================================
// Serial
// =============================================================================

/// Default baud rate
pub const DEFAULT_BAUD: u32 = 115200;

/// The discrete baud rates the device layer will program
pub const SUPPORTED_BAUDS: [u32; 7] = [9600, 19200, 38400, 57600, 115200, 230400, 460800];

/// Poll timeout for the blocking serial reader thread (milliseconds)
pub const SERIAL_READ_TIMEOUT_MS: u64 = 10;

/// Duration of a transmitted BREAK condition (milliseconds)
pub const BREAK_DURATION_MS: u64 = 250;

// =============================================================================
// Locking
// =============================================================================

/// Directory holding UUCP-style advisory device locks
pub const LOCK_DIR: &str = "/var/lock";

// =============================================================================
// Protocol
// =============================================================================

/// Default in-band escape byte (Control-^)
pub const DEFAULT_ESCAPE: u8 = 0x1e;

/// Maximum length of the board name shown in status reports
pub const BOARDNAME_MAX: usize = 15;

// =============================================================================
// Buffers
// =============================================================================

/// Read buffer size for socket and device reads
pub const READ_CHUNK: usize = 4096;

/// Channel capacity for async message passing
pub const CHANNEL_CAPACITY: usize = 256;

/// Maximum logged line length before truncation (ip2log)
pub const LINE_MAX: usize = 4095;
