//! Server-side wiring of one shell channel.
//!
//! [`ShellChannel`] is what a transport drives once it has granted a shell
//! channel: it asks the factory for a shell, binds the session if the shell
//! wants it, wires the streams and exit callback, collects `env` and
//! `pty-req` style requests into the environment, starts the shell, and
//! forwards signals and window changes while it runs.

use std::io::{Read, Write};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::environment::{Environment, EnvironmentBuilder};
use crate::error::ShellError;
use crate::exit::ExitCallback;
use crate::factory::ShellFactory;
use crate::session::ServerSession;
use crate::shell::{Shell, ShellState};
use crate::signal::{Signal, SignalListener};

/// Unique identifier for a channel within a session.
pub type ChannelId = u32;

/// The byte streams a transport provides for one channel.
pub struct ChannelStreams {
    /// Bytes from the client.
    pub input: Box<dyn Read + Send>,
    /// Bytes to the client's standard output.
    pub output: Box<dyn Write + Send>,
    /// Bytes to the client's standard error (extended data).
    pub error: Box<dyn Write + Send>,
}

/// A shell channel from request to teardown.
pub struct ShellChannel {
    id: ChannelId,
    session: Arc<dyn ServerSession>,
    shell: Shell,
    builder: EnvironmentBuilder,
    env: Option<Arc<Environment>>,
    exit_rx: Option<oneshot::Receiver<i32>>,
}

impl ShellChannel {
    /// Create the shell for a newly granted channel and wire it up.
    pub fn open(
        id: ChannelId,
        factory: &dyn ShellFactory,
        session: Arc<dyn ServerSession>,
        streams: ChannelStreams,
    ) -> Self {
        let mut shell = factory.create_shell();

        if let Some(aware) = shell.session_aware() {
            aware.set_session(Arc::clone(&session));
        }

        let (callback, exit_rx) = ExitCallback::channel();
        shell.set_input_stream(streams.input);
        shell.set_output_stream(streams.output);
        shell.set_error_stream(streams.error);
        shell.set_exit_callback(callback);

        log::debug!(
            "session {} channel {id}: shell created for {}",
            session.id(),
            session.username()
        );

        Self {
            id,
            session,
            shell,
            builder: EnvironmentBuilder::new(),
            env: None,
            exit_rx: Some(exit_rx),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn session(&self) -> &Arc<dyn ServerSession> {
        &self.session
    }

    pub fn state(&self) -> ShellState {
        self.shell.state()
    }

    /// The environment handed to the shell, once started.
    pub fn environment(&self) -> Option<&Arc<Environment>> {
        self.env.as_ref()
    }

    /// Record a client `env` request.
    pub fn env_request(&mut self, name: &str, value: &str) {
        if self.env.is_some() {
            log::warn!("channel {}: env request for {name} after start ignored", self.id);
            return;
        }
        self.builder.var(name, value);
    }

    /// Record a client PTY request.
    pub fn pty_request(&mut self, term: &str, cols: u16, rows: u16) {
        if self.env.is_some() {
            log::warn!("channel {}: pty request after start ignored", self.id);
            return;
        }
        self.builder.pty(term, cols, rows);
    }

    /// Subscribe a server-side listener before the shell starts. `None`
    /// subscribes to every signal.
    pub fn watch_signals(&mut self, signals: Option<Vec<Signal>>, listener: Arc<dyn SignalListener>) {
        match &self.env {
            Some(env) => match signals {
                Some(set) => env.add_signal_listeners(set, listener),
                None => env.add_global_signal_listener(listener),
            },
            None => {
                self.builder.listener(signals, listener);
            }
        }
    }

    /// Build the environment and start the shell.
    ///
    /// A startup failure is returned here; the transport should reject or
    /// close the channel.
    pub fn start(&mut self) -> Result<(), ShellError> {
        if self.env.is_some() {
            return Err(ShellError::AlreadyStarted);
        }
        let env = self.builder.build();
        if self.session.username().is_empty() {
            log::debug!("channel {}: session has no user name", self.id);
        }

        match self.shell.start(Arc::clone(&env)) {
            Ok(()) => {
                log::info!(
                    "session {} channel {}: shell started",
                    self.session.id(),
                    self.id
                );
                self.env = Some(env);
                Ok(())
            }
            Err(err) => {
                log::warn!("channel {}: shell failed to start: {err}", self.id);
                Err(err)
            }
        }
    }

    /// Deliver a signal raised by the client. Returns how many listeners saw
    /// it; signals before start are dropped.
    pub fn signal(&self, signal: Signal) -> usize {
        match &self.env {
            Some(env) => env.signal(signal),
            None => {
                log::debug!("channel {}: {signal} before start dropped", self.id);
                0
            }
        }
    }

    /// Deliver a signal by its wire name (`INT`, `SIGWINCH`, ...).
    pub fn signal_by_name(&self, name: &str) -> Option<usize> {
        match Signal::from_name(name) {
            Some(signal) => Some(self.signal(signal)),
            None => {
                log::warn!("channel {}: unknown signal {name:?}", self.id);
                None
            }
        }
    }

    /// Record a client window-change and notify the shell.
    pub fn window_change(&self, cols: u16, rows: u16) {
        match &self.env {
            Some(env) => {
                env.set_window_size(cols, rows);
                env.signal(Signal::Winch);
            }
            None => log::debug!("channel {}: window change before start dropped", self.id),
        }
    }

    /// Exit status, if the shell has reported one. `None` while it runs,
    /// after a startup failure, or if the receiver was taken.
    pub fn try_exit_status(&mut self) -> Option<i32> {
        self.exit_rx.as_mut()?.try_recv().ok()
    }

    /// Hand the exit receiver to an async caller.
    pub fn take_exit_receiver(&mut self) -> Option<oneshot::Receiver<i32>> {
        self.exit_rx.take()
    }

    /// Tear the shell down. Safe to call any number of times.
    pub fn close(&mut self) {
        if !matches!(self.shell.state(), ShellState::Exited | ShellState::Destroyed) {
            log::info!("channel {}: closing running shell", self.id);
        }
        self.shell.destroy();
    }
}

impl Drop for ShellChannel {
    fn drop(&mut self) {
        self.close();
    }
}
