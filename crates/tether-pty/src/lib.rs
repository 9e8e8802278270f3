//! tether-pty: external-program shells for tether channels.
//!
//! # Architecture
//!
//! - [`PtyProcess`]: Runs a program on a pseudo-terminal sized from the
//!   channel environment. Window changes resize it, INT, QUIT and TSTP become
//!   control characters, and other signals reach the child as OS signals.
//! - [`PipedProcess`]: Runs a program on plain pipes, with optional
//!   line-discipline emulation ([`TtyOptions`]) for clients that expect a
//!   terminal. Signals reach the child as OS signals.
//! - [`ProcessShellFactory`]: Hands out a fresh process shell per channel in
//!   either [`ProcessMode`].

pub mod factory;
mod kill;
pub mod piped;
pub mod pty;
pub mod tty;

pub use factory::{ProcessMode, ProcessShellFactory};
pub use piped::PipedProcess;
pub use pty::{PtyError, PtyProcess, DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TERM};
pub use tty::{OnlcrReader, TtyInput, TtyOptions};
