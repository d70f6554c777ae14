//! ip2ser - multi-client serial console concentrator over TCP
//!
//! Usage:
//!   ip2ser -d /dev/ttyS0                      Serve on the default port
//!   ip2ser -d /dev/ttyUSB0 -p 2301 -b 57600   Custom port and baud
//!   ip2ser -d /dev/ttyS0 -r 'powercycle 3'    With a reboot command
//!
//! Run under a supervisor for background operation; the process stays in
//! the foreground.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use ip2ser::cli::Cli;
use ip2ser::config::Config;
use ip2ser::lockfile::LockDir;
use ip2ser::serial::SerialBackend;
use ip2ser::server::{Exit, NoBoardName, Server};

fn main() -> Result<()> {
    let cli = Cli::parse();
    ip2ser::init_tracing(cli.verbose);

    let cfg = Config::resolve(&cli).context("invalid configuration")?;

    let rt = tokio::runtime::Runtime::new()?;
    let exit = rt.block_on(run(cfg))?;
    drop(rt);

    match exit {
        // the traditional contract: signal-driven shutdown exits 1
        Exit::Shutdown => std::process::exit(1),
        Exit::DeviceGone => anyhow::bail!("serial device closed unexpectedly"),
    }
}

async fn run(cfg: Config) -> Result<Exit> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_task(shutdown_tx);

    let backend = SerialBackend::new(cfg.device.clone(), LockDir::system());
    let server = Server::bind(cfg, backend, Box::new(NoBoardName), shutdown_rx)
        .context("server startup failed")?;

    if let Ok(addr) = server.local_addr() {
        tracing::info!("listening on {}", addr);
    }

    Ok(server.run().await?)
}

/// TERM, INT, and HUP all mean the same thing: close the device, unlink
/// the lock, exit. SIGPIPE is already ignored by the Rust runtime, so
/// writes to departed clients surface as plain I/O errors.
fn spawn_signal_task(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
            return;
        };
        let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
            return;
        };
        let Ok(mut sighup) = signal(SignalKind::hangup()) else {
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
            _ = sighup.recv() => {}
        }
        let _ = shutdown_tx.send(true);
    });
}
