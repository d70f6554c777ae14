//! Board-name extension point
//!
//! A pluggable hook over device-egress chunks. Deployments with many
//! consoles can supply an implementation that sniffs a bootloader banner
//! and labels the port; the name then shows up in status reports.

/// Observer of device-to-clients traffic.
///
/// Return `Some(name)` to update the board name shown in status reports;
/// `None` leaves it unchanged.
pub trait BoardName: Send {
    fn observe(&mut self, chunk: &[u8]) -> Option<String>;
}

/// Default hook: never names the board
pub struct NoBoardName;

impl BoardName for NoBoardName {
    fn observe(&mut self, _chunk: &[u8]) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_hook_is_silent() {
        let mut hook = NoBoardName;
        assert_eq!(hook.observe(b"U-Boot 2024.01 (myboard)"), None);
    }
}
