use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tether_shell::{
    Environment, InvertedShell, ProcessKiller, ProcessStreams, ShellError, Signal, ENV_TERM,
};

use crate::kill;

/// Screen size used when the client did not negotiate one.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// `TERM` given to the child when the client did not send one.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Control characters waiting for the PTY writer before further ones are
/// dropped.
const CONTROL_QUEUE: usize = 16;

/// Failures setting up or driving a PTY shell.
#[derive(Debug)]
pub enum PtyError {
    /// The PTY pair or its master handles could not be obtained.
    Open(String),
    /// The program could not be started on the PTY.
    Spawn { program: String, reason: String },
    Resize(String),
    /// Control characters are arriving faster than the PTY accepts input.
    ControlBacklog,
    Io(std::io::Error),
}

impl std::fmt::Display for PtyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyError::Open(reason) => write!(f, "cannot set up PTY: {reason}"),
            PtyError::Spawn { program, reason } => {
                write!(f, "failed to spawn {program} on a PTY: {reason}")
            }
            PtyError::Resize(reason) => write!(f, "cannot resize PTY: {reason}"),
            PtyError::ControlBacklog => write!(f, "PTY input is backed up, control character dropped"),
            PtyError::Io(err) => write!(f, "PTY I/O: {err}"),
        }
    }
}

impl std::error::Error for PtyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PtyError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PtyError {
    fn from(err: std::io::Error) -> Self {
        PtyError::Io(err)
    }
}

impl From<PtyError> for ShellError {
    fn from(err: PtyError) -> Self {
        match err {
            PtyError::Io(e) => ShellError::Io(e),
            other => ShellError::StartFailed(other.to_string()),
        }
    }
}

/// PTY master writer shared between the input pump and the control writer.
#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Box<dyn Write + Send>>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut w = self
            .0
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "PTY writer poisoned"))?;
        w.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut w = self
            .0
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "PTY writer poisoned"))?;
        w.flush()
    }
}

/// Hangs up a PTY child without touching the [`PtyProcess`].
struct PtyKiller(Mutex<Box<dyn ChildKiller + Send + Sync>>);

impl ProcessKiller for PtyKiller {
    fn kill(&self) {
        let mut killer = match self.0.lock() {
            Ok(k) => k,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = killer.kill() {
            log::debug!("PTY kill handle: {e}");
        }
    }
}

/// A shell process running on a pseudo-terminal.
///
/// Output and errors arrive merged on the PTY master, so the wrapped shell
/// has no separate error stream. Control characters for INT, QUIT and TSTP
/// are queued to a writer thread, since the master may be full while the
/// input pump is blocked on it.
pub struct PtyProcess {
    command: Option<String>,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    master: Option<Box<dyn MasterPty + Send>>,
    control: Option<SyncSender<u8>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    exited: bool,
}

impl PtyProcess {
    /// A process for `command`, or the user's default shell (`$SHELL` or
    /// `/bin/sh`) when `None`. Nothing is spawned until `start`.
    pub fn new(command: Option<&str>) -> Self {
        Self {
            command: command.map(str::to_string),
            args: Vec::new(),
            cwd: None,
            master: None,
            control: None,
            child: None,
            exited: false,
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

    /// Spawn the child on a fresh PTY sized from the environment.
    fn spawn(&mut self, env: &Environment) -> Result<ProcessStreams, PtyError> {
        let (cols, rows) = env.window_size().unwrap_or((DEFAULT_COLS, DEFAULT_ROWS));
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let program = self.command.clone().unwrap_or_else(default_shell);
        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in env.get_env() {
            cmd.env(key, value);
        }
        if env.term().is_none() {
            cmd.env(ENV_TERM, DEFAULT_TERM);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| PtyError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;
        // From here on the child is ours to kill if setup fails.
        self.child = Some(child);
        self.exited = false;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(format!("no reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(format!("no writer: {e}")))?;
        let writer = SharedWriter(Arc::new(Mutex::new(writer)));

        let (control, queued) = mpsc::sync_channel(CONTROL_QUEUE);
        spawn_control_writer(writer.clone(), queued)?;

        log::debug!("spawned {program} on a {cols}x{rows} PTY");
        self.master = Some(pair.master);
        self.control = Some(control);

        Ok(ProcessStreams {
            stdin: Box::new(writer),
            stdout: reader,
            stderr: None,
        })
    }

    /// Resize the PTY to new dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let Some(master) = &self.master else {
            return Ok(());
        };
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    /// Queue a byte for the PTY master as if the user typed it. Never waits
    /// for the master to accept input.
    fn queue_control(&self, byte: u8) -> Result<(), PtyError> {
        let Some(control) = &self.control else {
            return Ok(());
        };
        match control.try_send(byte) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PtyError::ControlBacklog),
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("PTY control writer is gone");
                Ok(())
            }
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.process_id())
    }
}

impl InvertedShell for PtyProcess {
    fn start(&mut self, env: &Environment) -> Result<ProcessStreams, ShellError> {
        Ok(self.spawn(env)?)
    }

    fn exit_value(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.exited = true;
                Some(status.exit_code() as i32)
            }
            _ => None,
        }
    }

    fn on_signal(&mut self, signal: Signal, env: &Environment) {
        let result = match signal {
            Signal::Winch => match env.window_size() {
                Some((cols, rows)) => self.resize(cols, rows),
                None => Ok(()),
            },
            // The line discipline turns these into signals for the
            // foreground process group.
            Signal::Int => self.queue_control(0x03),
            Signal::Quit => self.queue_control(0x1c),
            Signal::Tstp => self.queue_control(0x1a),
            other => {
                match self.process_id() {
                    Some(pid) if !self.exited => kill::forward(pid, other),
                    _ => log::debug!("no live PTY child for {other}"),
                }
                Ok(())
            }
        };
        if let Err(e) = result {
            log::warn!("failed to deliver {signal} to PTY shell: {e}");
        }
    }

    fn destroy(&mut self) {
        self.control = None;
        if self.exited {
            return;
        }
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            self.exited = true;
            return;
        }
        if let Err(e) = child.kill() {
            log::warn!("failed to kill PTY child: {e}");
        }
    }

    fn killer(&mut self) -> Option<Arc<dyn ProcessKiller>> {
        let child = self.child.as_ref()?;
        Some(Arc::new(PtyKiller(Mutex::new(child.clone_killer()))))
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Returns the user's default shell, falling back to `/bin/sh`.
pub(crate) fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

fn spawn_control_writer(mut writer: SharedWriter, queued: Receiver<u8>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("pty-control".to_string())
        .spawn(move || {
            for byte in queued {
                if let Err(e) = writer.write_all(&[byte]).and_then(|()| writer.flush()) {
                    log::debug!("PTY control writer stopping: {e}");
                    break;
                }
            }
        })?;
    Ok(())
}
