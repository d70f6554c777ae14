//! Command-line interface definition using clap
//!
//! Provides structured argument parsing with automatic help generation.

use clap::Parser;
use std::path::PathBuf;

/// Multi-client serial console concentrator over TCP
#[derive(Parser, Debug, Default)]
#[command(name = "ip2ser")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Serial device (e.g. /dev/ttyS0)
    #[arg(short = 'd', long, value_name = "DEVICE")]
    pub device: Option<PathBuf>,

    /// TCP listen port (default 2300)
    #[arg(short = 'p', long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Baud rate (default 115200)
    #[arg(short = 'b', long, value_name = "BAUD")]
    pub baud: Option<u32>,

    /// Escape character, decimal or 0x-prefixed hex (default 0x1e = Control-^)
    #[arg(short = 'e', long, value_name = "BYTE", value_parser = parse_byte)]
    pub escape: Option<u8>,

    /// Raw protocol: no telnet negotiation or character translation
    #[arg(short = 'R', long)]
    pub raw: bool,

    /// Shell command line used to reboot the target
    #[arg(short = 'r', long, value_name = "CMD")]
    pub reboot_cmd: Option<String>,

    /// Optional TOML config file supplying defaults
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_byte(s: &str) -> std::result::Result<u8, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else {
        s.parse::<u8>()
    };
    parsed.map_err(|_| format!("'{}' is not a byte value", s))
}

// =============================================================================
// Tests
// =============================================================================
