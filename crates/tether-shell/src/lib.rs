//! tether-shell: the contract between a remote-access server and the shells it
//! hosts on granted shell channels.
//!
//! # Architecture
//!
//! - [`Environment`]: Negotiated variables plus the per-channel signal
//!   registry, built server-side with [`EnvironmentBuilder`].
//! - [`Shell`]: One shell instance: streams, exit callback, `start`,
//!   `destroy`. Hosts either a [`NativeShell`] routine or an
//!   [`InvertedShell`] process.
//! - [`ShellFactory`]: Produces a fresh [`Shell`] per channel request.
//! - [`ShellChannel`]: Server-side wiring of one channel, from factory to
//!   teardown.

pub mod channel;
pub mod echo;
pub mod environment;
pub mod error;
pub mod exit;
pub mod factory;
pub mod inverted;
pub mod pipe;
pub mod session;
pub mod shell;
pub mod signal;

pub use channel::{ChannelId, ChannelStreams, ShellChannel};
pub use echo::{EchoShell, EchoShellFactory};
pub use environment::{
    Environment, EnvironmentBuilder, ENV_COLUMNS, ENV_LINES, ENV_TERM, ENV_USER,
};
pub use error::{ShellError, FAILURE_EXIT_STATUS};
pub use exit::ExitCallback;
pub use factory::ShellFactory;
pub use inverted::{InvertedShell, ProcessKiller, ProcessStreams};
pub use pipe::{pipe, pipe_with_capacity, PipeReader, PipeWriter, PIPE_CAPACITY};
pub use session::{ServerSession, SessionAware, SessionId, SessionInfo};
pub use shell::{CancelToken, NativeShell, Shell, ShellDestroyer, ShellFlavor, ShellIo, ShellState};
pub use signal::{Signal, SignalListener};
