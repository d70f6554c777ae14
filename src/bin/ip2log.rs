//! ip2log - console log capture client
//!
//! Connects to a console server (typically ip2ser), cleans the byte
//! stream into lines, and appends them to a log file with optional
//! timestamps. A plain blocking forwarder: one connection, one file.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use ip2ser::constants::READ_CHUNK;
use ip2ser::logline::LineCleaner;

/// Console log capture client
#[derive(Parser, Debug)]
#[command(name = "ip2log")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server to read from, as `host` or `host:port`
    host: String,

    /// TCP port (alternative to host:port)
    port: Option<u16>,

    /// Log to FILE (default: HOST-PORT.txt)
    #[arg(short = 'f', long, value_name = "FILE")]
    file: Option<PathBuf>,

    /// Append to the log file (default: overwrite)
    #[arg(short = 'a', long)]
    append: bool,

    /// Raw mode: no character translation, bytes copied verbatim
    #[arg(short = 'R', long)]
    raw: bool,

    /// Timestamps: -t for seconds, -tt for microseconds
    #[arg(short = 't', action = clap::ArgAction::Count)]
    timestamp: u8,

    /// Enable verbose debug output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stamp {
    None,
    Seconds,
    Micros,
}

impl Stamp {
    fn from_count(count: u8) -> Self {
        match count {
            0 => Stamp::None,
            1 => Stamp::Seconds,
            _ => Stamp::Micros,
        }
    }

    fn prefix(self) -> String {
        let now = chrono::Local::now();
        match self {
            Stamp::None => String::new(),
            Stamp::Seconds => now.format("[%m/%d %H:%M:%S] ").to_string(),
            Stamp::Micros => now.format("[%m/%d %H:%M:%S%.6f] ").to_string(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    ip2ser::init_tracing(cli.verbose);

    let (host, port) = split_endpoint(&cli.host, cli.port)?;
    let stamp = Stamp::from_count(cli.timestamp);
    let file = cli
        .file
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}-{}.txt", host, port)));

    let mut sock = TcpStream::connect((host.as_str(), port))
        .with_context(|| format!("cannot connect to {}:{}", host, port))?;

    let mut log = OpenOptions::new()
        .create(true)
        .write(true)
        .append(cli.append)
        .truncate(!cli.append)
        .open(&file)
        .with_context(|| format!("cannot open {}", file.display()))?;

    tracing::info!("logging {}:{} to {}", host, port, file.display());

    write_line(
        &mut log,
        stamp,
        format!("%%% Connected to {}:{}", host, port).as_bytes(),
    )?;

    let mut cleaner = LineCleaner::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = match sock.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        if cli.raw {
            log.write_all(&buf[..n])?;
            continue;
        }

        for line in cleaner.feed(&buf[..n]) {
            write_line(&mut log, stamp, &line)?;
        }
    }

    if let Some(tail) = cleaner.flush() {
        write_line(&mut log, stamp, &tail)?;
    }
    write_line(&mut log, stamp, b"%%% Connection closed")?;

    Ok(())
}

fn write_line(log: &mut std::fs::File, stamp: Stamp, line: &[u8]) -> Result<()> {
    log.write_all(stamp.prefix().as_bytes())?;
    log.write_all(line)?;
    log.write_all(b"\n")?;
    Ok(())
}

/// Accept `host port`, `host:port`, or `host:port port` (explicit port wins)
fn split_endpoint(host: &str, port: Option<u16>) -> Result<(String, u16)> {
    match host.rsplit_once(':') {
        Some((name, p)) => {
            let inline: u16 = p.parse().context("invalid port in host:port")?;
            Ok((name.to_string(), port.unwrap_or(inline)))
        }
        None => {
            let port = port.context("no port given")?;
            Ok((host.to_string(), port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_host_and_port() {
        assert_eq!(
            split_endpoint("console1", Some(2300)).unwrap(),
            ("console1".to_string(), 2300)
        );
    }

    #[test]
    fn endpoint_combined() {
        assert_eq!(
            split_endpoint("console1:2301", None).unwrap(),
            ("console1".to_string(), 2301)
        );
    }

    #[test]
    fn endpoint_explicit_port_wins() {
        assert_eq!(
            split_endpoint("console1:2301", Some(2400)).unwrap(),
            ("console1".to_string(), 2400)
        );
    }

    #[test]
    fn endpoint_missing_port_is_an_error() {
        assert!(split_endpoint("console1", None).is_err());
    }

    #[test]
    fn stamp_counts() {
        assert_eq!(Stamp::from_count(0), Stamp::None);
        assert_eq!(Stamp::from_count(1), Stamp::Seconds);
        assert_eq!(Stamp::from_count(2), Stamp::Micros);
        assert_eq!(Stamp::from_count(5), Stamp::Micros);
    }

    #[test]
    fn stamp_formats() {
        assert_eq!(Stamp::None.prefix(), "");
        // [MM/DD HH:MM:SS]
        let s = Stamp::Seconds.prefix();
        assert_eq!(s.len(), "[MM/DD HH:MM:SS] ".len());
        assert!(s.starts_with('['));
        assert!(s.ends_with("] "));
        // [MM/DD HH:MM:SS.uuuuuu]
        let us = Stamp::Micros.prefix();
        assert_eq!(us.len(), "[MM/DD HH:MM:SS.uuuuuu] ".len());
        assert!(us.contains('.'));
    }
}
