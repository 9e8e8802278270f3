//! A native shell that echoes every line back to the client.
//!
//! Useful for smoke-testing a transport: it exercises input, output, signal
//! registration and the exit callback without spawning anything.

use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::environment::Environment;
use crate::error::ShellError;
use crate::factory::ShellFactory;
use crate::shell::{NativeShell, Shell, ShellIo};
use crate::signal::{Signal, SignalListener};

/// Status reported when an interrupt or hang-up ended the session.
pub const INTERRUPTED_EXIT_STATUS: i32 = 130;

/// Interrupt flag and the listener that sets it.
type InterruptHook = (Arc<AtomicBool>, Arc<dyn SignalListener>);

#[derive(Default)]
pub struct EchoShell {
    prompt: Option<String>,
    interrupt: Option<InterruptHook>,
}

impl EchoShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Print `prompt` before each line is read.
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            interrupt: None,
        }
    }
}

impl NativeShell for EchoShell {
    // Listen before start returns so a signal sent right after start is
    // not lost to the thread startup.
    fn prepare(&mut self, env: &Environment) -> Result<(), ShellError> {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);
        let listener: Arc<dyn SignalListener> = Arc::new(move |_s: Signal| {
            flag.store(true, Ordering::SeqCst);
        });
        env.add_signal_listeners([Signal::Int, Signal::Hup, Signal::Term], Arc::clone(&listener));
        self.interrupt = Some((interrupted, listener));
        Ok(())
    }

    fn run(&mut self, io: ShellIo, env: Arc<Environment>) -> Result<i32, ShellError> {
        let (interrupted, listener) = match self.interrupt.take() {
            Some(hook) => hook,
            None => return Err(ShellError::NotConfigured("signal listener")),
        };
        let result = self.echo_lines(io, &interrupted);
        env.remove_signal_listener(&listener);
        result
    }
}

impl EchoShell {
    // Signals and cancellation are noticed between lines; a blocked read
    // ends when the transport closes the input stream.
    fn echo_lines(&self, io: ShellIo, interrupted: &AtomicBool) -> Result<i32, ShellError> {
        let cancel = io.cancel_token();
        let ShellIo {
            input, mut output, ..
        } = io;
        let mut reader = BufReader::new(input);
        let mut line = String::new();

        loop {
            if cancel.is_cancelled() || interrupted.load(Ordering::SeqCst) {
                return Ok(INTERRUPTED_EXIT_STATUS);
            }
            if let Some(prompt) = &self.prompt {
                output.write_all(prompt.as_bytes())?;
                output.flush()?;
            }

            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(0);
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed == "exit" {
                return Ok(0);
            }
            if cancel.is_cancelled() || interrupted.load(Ordering::SeqCst) {
                return Ok(INTERRUPTED_EXIT_STATUS);
            }
            output.write_all(format!("{trimmed}\r\n").as_bytes())?;
            output.flush()?;
        }
    }
}

/// Creates [`EchoShell`]s.
#[derive(Debug, Default, Clone)]
pub struct EchoShellFactory {
    prompt: Option<String>,
}

impl EchoShellFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
        }
    }
}

impl ShellFactory for EchoShellFactory {
    fn create_shell(&self) -> Shell {
        let shell = match &self.prompt {
            Some(p) => EchoShell::with_prompt(p.clone()),
            None => EchoShell::new(),
        };
        Shell::native(shell)
    }
}
