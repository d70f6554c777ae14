//! Escape-prefix interpreter
//!
//! Transforms one raw inbound chunk from a client into the literal bytes
//! destined for the serial device plus the administrative commands embedded
//! in the stream. Along the way it strips telnet option negotiation and
//! normalizes erase characters and line endings.
//!
//! The command-pending flag lives on the filter, and the filter lives on the
//! client session, so interleaved input from different clients cannot
//! corrupt each other's command state.

use crate::telnet;

/// Administrative commands recognized after the escape byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Send a serial BREAK
    Break,
    /// Broadcast ANSI clear-screen + cursor home
    ClearScreen,
    /// Disconnect every other client
    Exclusive,
    /// Run the configured reboot command
    Reboot,
    /// Status report to the triggering client
    Status,
    /// Broadcast a terminal reset sequence
    TtyReset,
    /// Disconnect the triggering client
    Disconnect,
    /// Reprogram the device baud rate, broadcasting the change
    SetBaud(u32),
    /// Help page to the triggering client
    Help,
}

/// Result of one interpreter pass over an inbound chunk
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Pass {
    /// Literal bytes surviving for the device
    pub bytes: Vec<u8>,
    /// Commands in stream order, paired with the raw argument byte
    pub commands: Vec<(u8, Command)>,
}

/// Per-client stateful byte-stream cleanup
#[derive(Debug)]
pub struct EscapeFilter {
    esc: u8,
    cmd_pending: bool,
}

impl EscapeFilter {
    pub fn new(esc: u8) -> Self {
        Self {
            esc,
            cmd_pending: false,
        }
    }

    /// True exactly when the previous inbound byte was the escape byte and
    /// the next byte will be consumed as a command argument.
    pub fn cmd_pending(&self) -> bool {
        self.cmd_pending
    }

    /// Run one chunk through the interpreter.
    ///
    /// Rules are applied left-to-right; a byte is either emitted, consumed
    /// as a command argument, or consumed as protocol noise, never more
    /// than one of those. The command-pending state persists across calls.
    pub fn feed(&mut self, input: &[u8]) -> Pass {
        let mut pass = Pass::default();
        let mut i = 0;

        while i < input.len() {
            let b = input[i];

            // Command argument byte
            if self.cmd_pending {
                self.cmd_pending = false;
                if b == self.esc {
                    // "type the escape char" idiom
                    pass.bytes.push(self.esc);
                } else if let Some(cmd) = dispatch(b) {
                    pass.commands.push((b, cmd));
                }
                // unknown arguments are silently discarded
                i += 1;
                continue;
            }

            // Telnet option stripping
            if b == telnet::IAC {
                let remaining = input.len() - i;
                if remaining >= 3 && telnet::is_option_verb(input[i + 1]) {
                    i += 3;
                } else if remaining >= 2 {
                    i += 2;
                } else {
                    // truncated sequence at end of chunk, no carry-over
                    i += 1;
                }
                continue;
            }

            // Erase normalization
            if b == 0x7f {
                pass.bytes.push(0x08);
                i += 1;
                continue;
            }

            // CR LF / CR NUL collapse to a single CR
            if b == 0x0d && i + 1 < input.len() && (input[i + 1] == 0x0a || input[i + 1] == 0x00) {
                pass.bytes.push(0x0d);
                i += 2;
                continue;
            }

            // Escape trigger
            if b == self.esc {
                self.cmd_pending = true;
                i += 1;
                continue;
            }

            pass.bytes.push(b);
            i += 1;
        }

        pass
    }
}

/// Map a command argument byte to its action. Letters are case-insensitive.
fn dispatch(arg: u8) -> Option<Command> {
    match arg.to_ascii_lowercase() {
        b'b' => Some(Command::Break),
        b'c' => Some(Command::ClearScreen),
        b'e' => Some(Command::Exclusive),
        b'r' => Some(Command::Reboot),
        b's' => Some(Command::Status),
        b't' => Some(Command::TtyReset),
        b'.' => Some(Command::Disconnect),
        b'1' => Some(Command::SetBaud(115200)),
        b'5' => Some(Command::SetBaud(57600)),
        b'3' => Some(Command::SetBaud(38400)),
        b'2' => Some(Command::SetBaud(19200)),
        b'9' => Some(Command::SetBaud(9600)),
        b'?' => Some(Command::Help),
        _ => None,
    }
}

/// Render an escape byte as the `Control-X` name used in status reports.
pub fn esc_name(esc: u8) -> String {
    match esc {
        0x1c => "Control-\\".to_string(),
        0x1d => "Control-]".to_string(),
        0x1e => "Control-^".to_string(),
        0x1f => "Control-_".to_string(),
        0x01..=0x1a => format!("Control-{}", (b'A' + esc - 1) as char),
        _ => "UNKNOWN".to_string(),
    }
}

/// The escape byte must render as a `Control-X` name. Enforced at config
/// parse time rather than at status-print time.
pub fn is_valid_escape(esc: u8) -> bool {
    matches!(esc, 0x01..=0x1a | 0x1c..=0x1f)
}
