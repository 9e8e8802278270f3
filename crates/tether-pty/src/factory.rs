use std::path::PathBuf;

use tether_shell::{Shell, ShellFactory};

use crate::piped::PipedProcess;
use crate::pty::{default_shell, PtyProcess};
use crate::tty::TtyOptions;

/// How a [`ProcessShellFactory`] connects the process to the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    /// On a pseudo-terminal. Output and errors are merged.
    Pty,
    /// Through plain pipes with the given line-discipline emulation.
    Piped(TtyOptions),
}

/// Factory for shells backed by an external program.
#[derive(Debug, Clone)]
pub struct ProcessShellFactory {
    command: Option<String>,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    mode: ProcessMode,
}

impl ProcessShellFactory {
    /// Runs `command`, or the user's default shell when `None`, on a PTY.
    pub fn new(command: Option<&str>) -> Self {
        Self {
            command: command.map(str::to_string),
            args: Vec::new(),
            cwd: None,
            mode: ProcessMode::Pty,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn mode(mut self, mode: ProcessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn process_mode(&self) -> ProcessMode {
        self.mode
    }
}

impl ShellFactory for ProcessShellFactory {
    fn create_shell(&self) -> Shell {
        match self.mode {
            ProcessMode::Pty => {
                let mut process = PtyProcess::new(self.command.as_deref()).args(self.args.clone());
                if let Some(dir) = &self.cwd {
                    process = process.working_dir(dir.clone());
                }
                Shell::process(process)
            }
            ProcessMode::Piped(options) => {
                let command = self.command.clone().unwrap_or_else(default_shell);
                let mut process = PipedProcess::new(command)
                    .args(self.args.clone())
                    .tty_options(options);
                if let Some(dir) = &self.cwd {
                    process = process.working_dir(dir.clone());
                }
                Shell::process(process)
            }
        }
    }
}
