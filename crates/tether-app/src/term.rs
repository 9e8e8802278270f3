//! Local terminal queries for the loopback host.

use std::io;

use crossterm::terminal;
use crossterm::tty::IsTty;

/// Size of the controlling terminal as `(cols, rows)`, if there is one.
pub fn window_size() -> Option<(u16, u16)> {
    match terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => Some((cols, rows)),
        Ok(_) => None,
        Err(e) => {
            log::debug!("no terminal size: {e}");
            None
        }
    }
}

pub fn stdin_is_tty() -> bool {
    io::stdin().is_tty()
}

/// Puts the terminal in raw mode so keystrokes reach the remote PTY
/// untouched. The previous mode is restored on drop.
pub struct RawMode(());

impl RawMode {
    pub fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self(()))
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            log::warn!("failed to restore terminal mode: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_size_is_never_empty() {
        // Under a test harness there may be no terminal at all.
        if let Some((cols, rows)) = window_size() {
            assert!(cols > 0 && rows > 0);
        }
    }
}
