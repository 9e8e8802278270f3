//! Wrapping external processes behind the shell contract.
//!
//! A native shell is handed the channel's streams; a process owns its own
//! streams and the wrapper has to move bytes between the two sides. Each
//! direction gets a dedicated OS thread because process pipes and PTYs only
//! offer blocking reads. A monitor thread polls the process for its exit
//! status, lets the output pumps drain, and then fires the exit callback.
//!
//! The process object sits behind one lock shared by the signal forwarder,
//! the monitor and `destroy`. Implementations must not block inside any
//! [`InvertedShell`] method; teardown additionally goes through an optional
//! [`ProcessKiller`] that needs no lock at all.

use std::io::{Read, Write};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, TryLockError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::environment::Environment;
use crate::error::{ShellError, FAILURE_EXIT_STATUS};
use crate::exit::ExitCallback;
use crate::session::SessionAware;
use crate::shell::{Control, ShellIo};
use crate::signal::{Signal, SignalListener};

/// How often the monitor asks the process whether it has exited.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long the monitor waits for buffered output after the process exits.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The process side of a wrapped shell.
pub struct ProcessStreams {
    /// Feeds the process's standard input.
    pub stdin: Box<dyn Write + Send>,
    pub stdout: Box<dyn Read + Send>,
    /// `None` when the process has no separate error stream (a PTY merges it
    /// into `stdout`).
    pub stderr: Option<Box<dyn Read + Send>>,
}

/// Kills a started process without going through its [`InvertedShell`].
pub trait ProcessKiller: Send + Sync {
    /// Must not block and must not fail; log instead.
    fn kill(&self);
}

/// An external process that can be hosted as a shell.
///
/// Every method is called with the process lock held, so none of them may
/// block on the process's own I/O.
pub trait InvertedShell: Send {
    /// Launch the process. Failing here fails `Shell::start`.
    fn start(&mut self, env: &Environment) -> Result<ProcessStreams, ShellError>;

    /// Exit status if the process has finished. Must not block.
    fn exit_value(&mut self) -> Option<i32>;

    /// React to a signal raised by the transport.
    fn on_signal(&mut self, _signal: Signal, _env: &Environment) {}

    /// Kill the process. Must not fail; log instead.
    fn destroy(&mut self);

    /// A kill handle usable while another thread holds the process. Asked
    /// for once, right after a successful `start`.
    fn killer(&mut self) -> Option<Arc<dyn ProcessKiller>> {
        None
    }

    fn session_aware(&mut self) -> Option<&mut dyn SessionAware> {
        None
    }
}

type SharedProcess = Arc<Mutex<Box<dyn InvertedShell>>>;

/// A started process plus its lock-free kill path.
#[derive(Clone)]
pub(crate) struct ProcessHandle {
    process: SharedProcess,
    killer: Option<Arc<dyn ProcessKiller>>,
}

impl ProcessHandle {
    pub(crate) fn new(mut shell: Box<dyn InvertedShell>) -> Self {
        let killer = shell.killer();
        Self {
            process: Arc::new(Mutex::new(shell)),
            killer,
        }
    }

    /// Kill the process. With a killer this never waits for the process
    /// lock; the process's own `destroy` runs only if the lock is free, and
    /// otherwise on drop.
    pub(crate) fn destroy(&self) {
        if let Some(killer) = &self.killer {
            killer.kill();
        }
        match self.process.try_lock() {
            Ok(mut p) => p.destroy(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().destroy(),
            Err(TryLockError::WouldBlock) if self.killer.is_some() => {
                log::debug!("process busy, killed through its kill handle");
            }
            Err(TryLockError::WouldBlock) => match self.process.lock() {
                Ok(mut p) => p.destroy(),
                Err(poisoned) => poisoned.into_inner().destroy(),
            },
        }
    }
}

/// Forwards transport signals to the process.
struct ProcessSignals {
    process: SharedProcess,
    env: Weak<Environment>,
}

impl SignalListener for ProcessSignals {
    fn signal(&self, signal: Signal) {
        let Some(env) = self.env.upgrade() else {
            return;
        };
        if let Ok(mut p) = self.process.lock() {
            p.on_signal(signal, &env);
        }
    }
}

/// Start pumps and monitor for a process that has just been launched.
pub(crate) fn launch(
    handle: ProcessHandle,
    streams: ProcessStreams,
    io: ShellIo,
    env: Arc<Environment>,
    exit: ExitCallback,
    control: Arc<Control>,
) -> Result<(), ShellError> {
    let ShellIo {
        input,
        output,
        error,
        ..
    } = io;

    let listener: Arc<dyn SignalListener> = Arc::new(ProcessSignals {
        process: Arc::clone(&handle.process),
        env: Arc::downgrade(&env),
    });
    env.add_global_signal_listener(Arc::clone(&listener));

    let launched = spawn_threads(
        &handle.process, streams, input, output, error, &env, &listener, exit, control,
    );
    if let Err(e) = launched {
        env.remove_signal_listener(&listener);
        handle.destroy();
        return Err(ShellError::StartFailed(format!("failed to spawn pump thread: {e}")));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_threads(
    process: &SharedProcess,
    streams: ProcessStreams,
    input: Box<dyn Read + Send>,
    output: Box<dyn Write + Send>,
    error: Box<dyn Write + Send>,
    env: &Arc<Environment>,
    listener: &Arc<dyn SignalListener>,
    exit: ExitCallback,
    control: Arc<Control>,
) -> std::io::Result<()> {
    let mut drains = Vec::new();

    pump("shell-stdin", input, streams.stdin, None)?;
    drains.push(pump_drained("shell-stdout", streams.stdout, output)?);
    if let Some(stderr) = streams.stderr {
        drains.push(pump_drained("shell-stderr", stderr, error)?);
    }

    let process = Arc::clone(process);
    let env = Arc::clone(env);
    let listener = Arc::clone(listener);
    thread::Builder::new()
        .name("shell-monitor".to_string())
        .spawn(move || {
            let status = wait_for_exit(&process);
            log::debug!("wrapped process exited with status {status}");

            let deadline = Instant::now() + DRAIN_TIMEOUT;
            for done in drains {
                let left = deadline.saturating_duration_since(Instant::now());
                if done.recv_timeout(left).is_err() {
                    log::debug!("output pump still busy after process exit");
                }
            }

            env.remove_signal_listener(&listener);
            control.mark_exited();
            exit.on_exit(status);
        })?;
    Ok(())
}

fn wait_for_exit(process: &SharedProcess) -> i32 {
    loop {
        let status = match process.lock() {
            Ok(mut p) => p.exit_value(),
            Err(_) => Some(FAILURE_EXIT_STATUS),
        };
        if let Some(status) = status {
            return status;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn pump_drained(
    name: &str,
    from: Box<dyn Read + Send>,
    to: Box<dyn Write + Send>,
) -> std::io::Result<mpsc::Receiver<()>> {
    let (tx, rx) = mpsc::channel();
    pump(name, from, to, Some(tx))?;
    Ok(rx)
}

/// Copy `from` into `to` on a dedicated thread until EOF or an error on
/// either side. `done` is signalled when the copy ends.
fn pump(
    name: &str,
    mut from: Box<dyn Read + Send>,
    mut to: Box<dyn Write + Send>,
    done: Option<mpsc::Sender<()>>,
) -> std::io::Result<()> {
    let label = name.to_string();
    thread::Builder::new().name(label.clone()).spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            let n = match from.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // PTY masters report EIO once the child side is gone.
                    log::debug!("{label}: read ended: {e}");
                    break;
                }
            };
            if let Err(e) = to.write_all(&buf[..n]).and_then(|_| to.flush()) {
                log::debug!("{label}: far end closed: {e}");
                break;
            }
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{pipe, PipeReader, PipeWriter};
    use crate::shell::{Shell, ShellState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    /// A fake process: echoes stdin to stdout upper-cased, exits with the
    /// number of lines seen when stdin closes, or 143 when killed.
    struct FakeProcess {
        status: Arc<Mutex<Option<i32>>>,
        signals: Arc<Mutex<Vec<Signal>>>,
        kills: Arc<AtomicUsize>,
        fail_start: bool,
        /// Signal handling waits on this, standing in for a write that
        /// cannot make progress.
        stall_signals: Option<mpsc::Receiver<()>>,
        hard_kills: Option<Arc<AtomicUsize>>,
    }

    impl FakeProcess {
        fn new() -> Self {
            Self {
                status: Arc::new(Mutex::new(None)),
                signals: Arc::new(Mutex::new(Vec::new())),
                kills: Arc::new(AtomicUsize::new(0)),
                fail_start: false,
                stall_signals: None,
                hard_kills: None,
            }
        }
    }

    /// Kill handle for [`FakeProcess`]: reports 137 like SIGKILL would.
    struct FakeKiller {
        status: Arc<Mutex<Option<i32>>>,
        kills: Arc<AtomicUsize>,
    }

    impl ProcessKiller for FakeKiller {
        fn kill(&self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
            let mut s = self.status.lock().unwrap();
            if s.is_none() {
                *s = Some(137);
            }
        }
    }

    impl InvertedShell for FakeProcess {
        fn start(&mut self, env: &Environment) -> Result<ProcessStreams, ShellError> {
            if self.fail_start {
                return Err(ShellError::StartFailed("no such program".to_string()));
            }
            let (stdin_r, stdin_w) = pipe();
            let (stdout_r, mut stdout_w) = pipe();
            let (stderr_r, mut stderr_w) = pipe();
            let term = env.term().unwrap_or_else(|| "dumb".to_string());
            writeln!(stderr_w, "term={term}")?;
            drop(stderr_w);

            let status = Arc::clone(&self.status);
            thread::spawn(move || {
                let mut lines = 0;
                let mut reader = std::io::BufReader::new(stdin_r);
                let mut line = String::new();
                while std::io::BufRead::read_line(&mut reader, &mut line).unwrap_or(0) > 0 {
                    lines += 1;
                    if stdout_w.write_all(line.to_uppercase().as_bytes()).is_err() {
                        break;
                    }
                    line.clear();
                }
                drop(stdout_w);
                let mut s = status.lock().unwrap();
                if s.is_none() {
                    *s = Some(lines);
                }
            });

            Ok(ProcessStreams {
                stdin: Box::new(stdin_w),
                stdout: Box::new(stdout_r),
                stderr: Some(Box::new(stderr_r)),
            })
        }

        fn exit_value(&mut self) -> Option<i32> {
            *self.status.lock().unwrap()
        }

        fn on_signal(&mut self, signal: Signal, _env: &Environment) {
            if let Some(stall) = &self.stall_signals {
                let _ = stall.recv();
            }
            self.signals.lock().unwrap().push(signal);
        }

        fn killer(&mut self) -> Option<Arc<dyn ProcessKiller>> {
            let kills = Arc::clone(self.hard_kills.as_ref()?);
            Some(Arc::new(FakeKiller {
                status: Arc::clone(&self.status),
                kills,
            }))
        }

        fn destroy(&mut self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
            let mut s = self.status.lock().unwrap();
            if s.is_none() {
                *s = Some(143);
            }
        }
    }

    struct Wired {
        stdin: PipeWriter,
        stdout: PipeReader,
        stderr: PipeReader,
        exit: oneshot::Receiver<i32>,
    }

    fn wire(shell: &mut Shell) -> Wired {
        let (in_r, in_w) = pipe();
        let (out_r, out_w) = pipe();
        let (err_r, err_w) = pipe();
        let (callback, exit) = ExitCallback::channel();
        shell.set_input_stream(Box::new(in_r));
        shell.set_output_stream(Box::new(out_w));
        shell.set_error_stream(Box::new(err_w));
        shell.set_exit_callback(callback);
        Wired {
            stdin: in_w,
            stdout: out_r,
            stderr: err_r,
            exit,
        }
    }

    fn wait_exit(rx: &mut oneshot::Receiver<i32>) -> Option<i32> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match rx.try_recv() {
                Ok(status) => return Some(status),
                Err(oneshot::error::TryRecvError::Closed) => return None,
                Err(oneshot::error::TryRecvError::Empty) => thread::sleep(Duration::from_millis(10)),
            }
        }
        None
    }

    #[test]
    fn test_streams_are_pumped_and_exit_reported() {
        let mut shell = Shell::process(FakeProcess::new());
        let mut wired = wire(&mut shell);
        let mut builder = crate::EnvironmentBuilder::new();
        builder.pty("vt220", 80, 24);
        shell.start(builder.build()).unwrap();
        assert_eq!(shell.state(), ShellState::Running);

        wired.stdin.write_all(b"ls\npwd\n").unwrap();
        drop(wired.stdin);

        assert_eq!(wait_exit(&mut wired.exit), Some(2));
        assert_eq!(shell.state(), ShellState::Exited);

        let mut out = String::new();
        wired.stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "LS\nPWD\n");
        let mut err = String::new();
        wired.stderr.read_to_string(&mut err).unwrap();
        assert_eq!(err, "term=vt220\n");
    }

    #[test]
    fn test_start_failure_is_synchronous() {
        let mut fake = FakeProcess::new();
        fake.fail_start = true;
        let mut shell = Shell::process(fake);
        let mut wired = wire(&mut shell);

        let err = shell.start(Arc::new(Environment::default())).unwrap_err();
        assert!(matches!(err, ShellError::StartFailed(_)));
        assert_eq!(
            wired.exit.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        );
    }

    #[test]
    fn test_signals_reach_process_until_exit() {
        let fake = FakeProcess::new();
        let seen = Arc::clone(&fake.signals);
        let mut shell = Shell::process(fake);
        let mut wired = wire(&mut shell);
        let env = Arc::new(Environment::default());
        shell.start(Arc::clone(&env)).unwrap();

        env.signal(Signal::Winch);
        env.signal(Signal::Int);
        assert_eq!(*seen.lock().unwrap(), vec![Signal::Winch, Signal::Int]);

        drop(wired.stdin);
        assert_eq!(wait_exit(&mut wired.exit), Some(0));
        assert_eq!(env.listener_count(), 0);
        env.signal(Signal::Term);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_destroy_kills_once_and_exit_fires_at_most_once() {
        let fake = FakeProcess::new();
        let kills = Arc::clone(&fake.kills);
        let mut shell = Shell::process(fake);
        let mut wired = wire(&mut shell);
        shell.start(Arc::new(Environment::default())).unwrap();

        shell.destroy();
        shell.destroy();
        assert_eq!(kills.load(Ordering::SeqCst), 1);
        assert_eq!(shell.state(), ShellState::Destroyed);

        assert_eq!(wait_exit(&mut wired.exit), Some(143));
        assert!(wired.exit.try_recv().is_err());
        assert_eq!(shell.state(), ShellState::Destroyed);
        drop(wired.stdin);
    }

    #[test]
    fn test_destroy_does_not_wait_behind_stalled_signal() {
        let (release, stall) = mpsc::channel();
        let hard_kills = Arc::new(AtomicUsize::new(0));
        let mut fake = FakeProcess::new();
        fake.stall_signals = Some(stall);
        fake.hard_kills = Some(Arc::clone(&hard_kills));
        let seen = Arc::clone(&fake.signals);

        let mut shell = Shell::process(fake);
        let mut wired = wire(&mut shell);
        let env = Arc::new(Environment::default());
        shell.start(Arc::clone(&env)).unwrap();

        let signaller = {
            let env = Arc::clone(&env);
            thread::spawn(move || env.signal(Signal::Int))
        };
        // Let the signal handler take the process lock and stall.
        thread::sleep(Duration::from_millis(50));

        let destroyer = shell.destroyer();
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            destroyer.destroy();
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert_eq!(hard_kills.load(Ordering::SeqCst), 1);
        assert_eq!(shell.state(), ShellState::Destroyed);

        release.send(()).unwrap();
        assert_eq!(signaller.join().unwrap(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![Signal::Int]);
        assert_eq!(wait_exit(&mut wired.exit), Some(137));
        drop(wired.stdin);
    }

    #[test]
    fn test_closed_output_does_not_hang_pump() {
        let mut shell = Shell::process(FakeProcess::new());
        let mut wired = wire(&mut shell);
        shell.start(Arc::new(Environment::default())).unwrap();

        drop(wired.stdout);
        wired.stdin.write_all(b"one\ntwo\n").unwrap();
        drop(wired.stdin);
        assert!(wait_exit(&mut wired.exit).is_some());
    }
}
