use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tether_shell::{
    pipe, Environment, InvertedShell, ProcessKiller, ProcessStreams, ShellError, Signal,
    FAILURE_EXIT_STATUS,
};

use crate::kill::{self, PidKiller};
use crate::tty::{OnlcrReader, SharedSink, TtyInput, TtyOptions};

/// A process connected through plain pipes, for channels that did not ask
/// for a PTY. Standard error stays separate from standard output.
pub struct PipedProcess {
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    options: TtyOptions,
    child: Option<Child>,
    reaped: Arc<AtomicBool>,
}

impl PipedProcess {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            options: TtyOptions::default(),
            child: None,
            reaped: Arc::new(AtomicBool::new(false)),
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

    pub fn tty_options(mut self, options: TtyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn process_id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn kill(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            self.reaped.store(true, Ordering::SeqCst);
            return;
        }
        if let Err(e) = child.kill() {
            log::warn!("failed to kill {}: {e}", self.command);
        }
    }
}

impl InvertedShell for PipedProcess {
    fn start(&mut self, env: &Environment) -> Result<ProcessStreams, ShellError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(env.get_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ShellError::StartFailed(format!("failed to spawn {}: {e}", self.command)))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            return Err(ShellError::StartFailed("child stdio not captured".to_string()));
        };

        // Process output and input echo share one ordered stream.
        let (merged_r, merged_w) = pipe();
        let sink: SharedSink = Arc::new(Mutex::new(Some(merged_w)));
        if let Err(e) = spawn_stdout_copier(stdout, Arc::clone(&sink)) {
            let _ = child.kill();
            return Err(e.into());
        }

        let stdout: Box<dyn Read + Send> = if self.options.onlcr {
            Box::new(OnlcrReader::new(merged_r))
        } else {
            Box::new(merged_r)
        };
        let stderr: Box<dyn Read + Send> = if self.options.onlcr {
            Box::new(OnlcrReader::new(stderr))
        } else {
            Box::new(stderr)
        };

        log::debug!("spawned {} with piped stdio", self.command);
        self.child = Some(child);
        self.reaped = Arc::new(AtomicBool::new(false));

        Ok(ProcessStreams {
            stdin: Box::new(TtyInput::new(stdin, self.options, &sink)),
            stdout,
            stderr: Some(stderr),
        })
    }

    fn exit_value(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.reaped.store(true, Ordering::SeqCst);
                Some(exit_code(status))
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("lost track of {}: {e}", self.command);
                Some(FAILURE_EXIT_STATUS)
            }
        }
    }

    fn on_signal(&mut self, signal: Signal, _env: &Environment) {
        if signal == Signal::Winch {
            log::debug!("piped shell has no window to resize");
            return;
        }
        match &self.child {
            Some(child) if !self.reaped.load(Ordering::SeqCst) => kill::forward(child.id(), signal),
            _ => log::debug!("no live child for {signal}"),
        }
    }

    fn destroy(&mut self) {
        self.kill();
    }

    fn killer(&mut self) -> Option<Arc<dyn ProcessKiller>> {
        let child = self.child.as_ref()?;
        Some(Arc::new(PidKiller {
            pid: child.id(),
            reaped: Arc::clone(&self.reaped),
        }))
    }
}

impl Drop for PipedProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn spawn_stdout_copier(
    mut stdout: std::process::ChildStdout,
    sink: SharedSink,
) -> io::Result<()> {
    std::thread::Builder::new()
        .name("piped-stdout".to_string())
        .spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                let n = match stdout.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let mut guard = match sink.lock() {
                    Ok(g) => g,
                    Err(_) => break,
                };
                let Some(out) = guard.as_mut() else {
                    break;
                };
                if std::io::Write::write_all(out, &buf[..n]).is_err() {
                    break;
                }
            }
            // Dropping the writer gives the merged reader its EOF.
            if let Ok(mut guard) = sink.lock() {
                guard.take();
            }
        })?;
    Ok(())
}

/// Exit code, or 128 + signal number for a child killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    FAILURE_EXIT_STATUS
}
