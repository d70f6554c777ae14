//! ip2ser - multi-client serial console concentrator over TCP
//!
//! A single process exclusively owns a serial device, accepts many
//! simultaneous TCP clients, multiplexes their byte streams into the
//! device, and fans the device's output back to every client. An in-band
//! escape-prefix command language provides line control (BREAK, baud
//! changes, target reboot, exclusive takeover, status, disconnect), and
//! just enough telnet is spoken to keep stock `telnet` clients from
//! corrupting the serial stream.
//!
//! The companion `ip2log` binary is a single-connection logging client
//! that turns the concentrator's byte stream into clean, optionally
//! timestamped log lines.

pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod escape;
pub mod lockfile;
pub mod logline;
pub mod serial;
pub mod server;
pub mod telnet;

pub use error::{Error, Result};

/// Initialize tracing for diagnostic output
///
/// Call early in main() before any logging occurs.
/// Set `verbose` to true for debug-level output.
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let level = if verbose { "debug" } else { "info" };

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_file(false)
                .compact(),
        )
        .with(tracing_subscriber::EnvFilter::new(level))
        .try_init();
}
