//! Configuration management
//!
//! Command-line flags are the primary interface; an optional TOML file
//! supplies defaults for deployments that prefer one (flags win). All
//! values are validated once, at build time, into a `Config` the rest of
//! the process treats as authoritative.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cli::Cli;
use crate::constants::{DEFAULT_BAUD, DEFAULT_ESCAPE, DEFAULT_TCP_PORT};
use crate::error::{Error, Result};
use crate::escape::is_valid_escape;
use crate::serial::discrete_baud;

/// Validated process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Serial device path (e.g. /dev/ttyS0)
    pub device: PathBuf,
    /// TCP listen port
    pub tcp_port: u16,
    /// Initial baud rate
    pub baud: u32,
    /// In-band escape byte
    pub escape: u8,
    /// Raw protocol: no telnet negotiation, stripping, or sanitation
    pub raw: bool,
    /// Shell command line used to reboot the target
    pub reboot_cmd: Option<String>,
}

/// Optional config-file section, everything defaultable
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub device: Option<PathBuf>,
    pub tcp_port: Option<u16>,
    pub baud: Option<u32>,
    pub escape: Option<u8>,
    pub raw: Option<bool>,
    pub reboot_cmd: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigValidation {
            field: "config file",
            reason: e.to_string(),
        })
    }
}

impl Config {
    /// Merge file defaults and CLI flags, then validate.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let device = cli
            .device
            .clone()
            .or(file.device)
            .ok_or(Error::ConfigValidation {
                field: "device",
                reason: "no serial device given (use -d)".to_string(),
            })?;

        let cfg = Self {
            device,
            tcp_port: cli.port.or(file.tcp_port).unwrap_or(DEFAULT_TCP_PORT),
            baud: cli.baud.or(file.baud).unwrap_or(DEFAULT_BAUD),
            escape: cli.escape.or(file.escape).unwrap_or(DEFAULT_ESCAPE),
            raw: cli.raw || file.raw.unwrap_or(false),
            reboot_cmd: cli.reboot_cmd.clone().or(file.reboot_cmd),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        discrete_baud(self.baud)?;
        if !is_valid_escape(self.escape) {
            return Err(Error::ConfigValidation {
                field: "escape",
                reason: format!(
                    "byte 0x{:02x} has no Control-X name (allowed: 0x01-0x1a, 0x1c-0x1f)",
                    self.escape
                ),
            });
        }
        Ok(())
    }
}
