//! The shell contract: three streams, an exit callback, start and destroy.
//!
//! A [`Shell`] is created unconfigured by a factory, wired by the server,
//! started once with an [`Environment`], and either exits on its own or is
//! destroyed. The flavor decides how the work runs:
//!
//! - [`ShellFlavor::Native`] runs a [`NativeShell`] routine on a dedicated
//!   OS thread and hands it the streams directly.
//! - [`ShellFlavor::Process`] starts an [`InvertedShell`] (an external
//!   process) and pumps bytes between its streams and the channel's.

use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::environment::Environment;
use crate::error::{ShellError, FAILURE_EXIT_STATUS};
use crate::exit::ExitCallback;
use crate::inverted::{self, InvertedShell, ProcessHandle};
use crate::session::SessionAware;

/// Lifecycle state of a shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    /// Produced by a factory; nothing wired yet.
    Created,
    /// Streams and exit callback are all set.
    Configured,
    Running,
    /// Finished on its own and reported through the exit callback.
    Exited,
    /// Torn down by the server, or failed to start.
    Destroyed,
}

/// Cooperative cancellation flag handed to native shells.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Streams owned by a running native shell.
pub struct ShellIo {
    pub input: Box<dyn Read + Send>,
    pub output: Box<dyn Write + Send>,
    pub error: Box<dyn Write + Send>,
    cancel: CancelToken,
}

impl ShellIo {
    /// `true` once the server destroyed the shell. Routines should check
    /// this between reads and return promptly.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

/// A shell implemented inside the server process.
pub trait NativeShell: Send {
    /// Fallible setup that must happen before the shell is considered
    /// started. Runs synchronously inside [`Shell::start`].
    fn prepare(&mut self, _env: &Environment) -> Result<(), ShellError> {
        Ok(())
    }

    /// The shell's main loop. Runs on its own thread; the returned status is
    /// delivered through the exit callback. An `Err` is reported as
    /// [`FAILURE_EXIT_STATUS`].
    fn run(&mut self, io: ShellIo, env: Arc<Environment>) -> Result<i32, ShellError>;

    fn session_aware(&mut self) -> Option<&mut dyn SessionAware> {
        None
    }
}

/// The closed set of ways a shell can do its work.
pub enum ShellFlavor {
    Native(Box<dyn NativeShell>),
    Process(Box<dyn InvertedShell>),
}

impl ShellFlavor {
    fn name(&self) -> &'static str {
        match self {
            ShellFlavor::Native(_) => "native",
            ShellFlavor::Process(_) => "process",
        }
    }
}

struct Inner {
    state: ShellState,
    process: Option<ProcessHandle>,
}

/// State shared between the shell handle, its worker threads, and any
/// [`ShellDestroyer`]s.
pub(crate) struct Control {
    inner: Mutex<Inner>,
    cancel: CancelToken,
}

impl Control {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ShellState::Created,
                process: None,
            }),
            cancel: CancelToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn state(&self) -> ShellState {
        self.lock().state
    }

    /// Natural exit. A destroyed shell stays destroyed.
    pub(crate) fn mark_exited(&self) {
        let mut inner = self.lock();
        if inner.state == ShellState::Running {
            inner.state = ShellState::Exited;
        }
        inner.process = None;
    }

    fn destroy(&self) {
        let process = {
            let mut inner = self.lock();
            match inner.state {
                ShellState::Exited | ShellState::Destroyed => return,
                _ => {}
            }
            log::debug!("destroying shell in state {:?}", inner.state);
            inner.state = ShellState::Destroyed;
            inner.process.take()
        };

        self.cancel.cancel();
        if let Some(process) = process {
            process.destroy();
        }
    }
}

/// Cloneable handle that can destroy a shell from another thread.
#[derive(Clone)]
pub struct ShellDestroyer {
    control: Arc<Control>,
}

impl ShellDestroyer {
    pub fn destroy(&self) {
        self.control.destroy();
    }
}

/// One shell instance, owned by the server for the lifetime of a channel.
pub struct Shell {
    flavor: Option<ShellFlavor>,
    input: Option<Box<dyn Read + Send>>,
    output: Option<Box<dyn Write + Send>>,
    error: Option<Box<dyn Write + Send>>,
    exit: Option<ExitCallback>,
    control: Arc<Control>,
}

impl Shell {
    pub fn new(flavor: ShellFlavor) -> Self {
        Self {
            flavor: Some(flavor),
            input: None,
            output: None,
            error: None,
            exit: None,
            control: Arc::new(Control::new()),
        }
    }

    pub fn native(shell: impl NativeShell + 'static) -> Self {
        Self::new(ShellFlavor::Native(Box::new(shell)))
    }

    pub fn process(shell: impl InvertedShell + 'static) -> Self {
        Self::new(ShellFlavor::Process(Box::new(shell)))
    }

    pub fn state(&self) -> ShellState {
        self.control.state()
    }

    pub fn destroyer(&self) -> ShellDestroyer {
        ShellDestroyer {
            control: Arc::clone(&self.control),
        }
    }

    /// Session capability of the underlying shell, if it declares one.
    /// Only available before `start`.
    pub fn session_aware(&mut self) -> Option<&mut dyn SessionAware> {
        match self.flavor.as_mut()? {
            ShellFlavor::Native(shell) => shell.session_aware(),
            ShellFlavor::Process(shell) => shell.session_aware(),
        }
    }

    pub fn set_input_stream(&mut self, input: Box<dyn Read + Send>) {
        if self.accepts_wiring("input stream") {
            self.input = Some(input);
            self.refresh_configured();
        }
    }

    pub fn set_output_stream(&mut self, output: Box<dyn Write + Send>) {
        if self.accepts_wiring("output stream") {
            self.output = Some(output);
            self.refresh_configured();
        }
    }

    pub fn set_error_stream(&mut self, error: Box<dyn Write + Send>) {
        if self.accepts_wiring("error stream") {
            self.error = Some(error);
            self.refresh_configured();
        }
    }

    pub fn set_exit_callback(&mut self, callback: ExitCallback) {
        if self.accepts_wiring("exit callback") {
            self.exit = Some(callback);
            self.refresh_configured();
        }
    }

    fn accepts_wiring(&self, what: &str) -> bool {
        match self.state() {
            ShellState::Created | ShellState::Configured => true,
            state => {
                log::warn!("ignoring {what} set on shell in state {state:?}");
                false
            }
        }
    }

    fn refresh_configured(&mut self) {
        if self.missing().is_none() {
            let mut inner = self.control.lock();
            if inner.state == ShellState::Created {
                inner.state = ShellState::Configured;
            }
        }
    }

    fn missing(&self) -> Option<&'static str> {
        if self.input.is_none() {
            Some("input stream")
        } else if self.output.is_none() {
            Some("output stream")
        } else if self.error.is_none() {
            Some("error stream")
        } else if self.exit.is_none() {
            Some("exit callback")
        } else {
            None
        }
    }

    /// Start the shell.
    ///
    /// Returns once the shell's own execution has been launched. Failures to
    /// launch are returned here and the exit callback is never invoked;
    /// anything that goes wrong later arrives through the exit callback.
    pub fn start(&mut self, env: Arc<Environment>) -> Result<(), ShellError> {
        match self.state() {
            ShellState::Created => {
                return Err(ShellError::NotConfigured(self.missing().unwrap_or("shell")))
            }
            ShellState::Configured => {}
            ShellState::Running | ShellState::Exited => return Err(ShellError::AlreadyStarted),
            ShellState::Destroyed => return Err(ShellError::Destroyed),
        }

        let (Some(flavor), Some(input), Some(output), Some(error), Some(exit)) = (
            self.flavor.take(),
            self.input.take(),
            self.output.take(),
            self.error.take(),
            self.exit.take(),
        ) else {
            return Err(ShellError::AlreadyStarted);
        };

        log::debug!("starting {} shell", flavor.name());
        let io = ShellIo {
            input,
            output,
            error,
            cancel: self.control.cancel.clone(),
        };

        let result = match flavor {
            ShellFlavor::Native(shell) => self.start_native(shell, io, env, exit),
            ShellFlavor::Process(shell) => self.start_process(shell, io, env, exit),
        };

        if let Err(err) = &result {
            log::warn!("shell start failed: {err}");
            let mut inner = self.control.lock();
            inner.state = ShellState::Destroyed;
            inner.process = None;
        }
        result
    }

    fn start_native(
        &mut self,
        mut shell: Box<dyn NativeShell>,
        io: ShellIo,
        env: Arc<Environment>,
        exit: ExitCallback,
    ) -> Result<(), ShellError> {
        shell.prepare(&env)?;
        self.enter_running(None)?;

        let control = Arc::clone(&self.control);
        std::thread::Builder::new()
            .name("shell-native".to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| shell.run(io, env)));
                let status = match result {
                    Ok(Ok(status)) => status,
                    Ok(Err(err)) => {
                        log::warn!("native shell failed: {err}");
                        FAILURE_EXIT_STATUS
                    }
                    Err(_) => {
                        log::warn!("native shell panicked");
                        FAILURE_EXIT_STATUS
                    }
                };
                control.mark_exited();
                exit.on_exit(status);
            })
            .map_err(|e| {
                self.control.cancel.cancel();
                ShellError::StartFailed(format!("failed to spawn shell thread: {e}"))
            })?;
        Ok(())
    }

    fn start_process(
        &mut self,
        mut shell: Box<dyn InvertedShell>,
        io: ShellIo,
        env: Arc<Environment>,
        exit: ExitCallback,
    ) -> Result<(), ShellError> {
        let streams = shell.start(&env)?;
        let process = ProcessHandle::new(shell);

        if let Err(err) = self.enter_running(Some(process.clone())) {
            process.destroy();
            return Err(err);
        }

        inverted::launch(process, streams, io, env, exit, Arc::clone(&self.control))
    }

    /// Move to `Running` unless a destroy won the race while start was in
    /// progress.
    fn enter_running(&self, process: Option<ProcessHandle>) -> Result<(), ShellError> {
        let mut inner = self.control.lock();
        if inner.state == ShellState::Destroyed {
            return Err(ShellError::Destroyed);
        }
        inner.state = ShellState::Running;
        inner.process = process;
        Ok(())
    }

    /// Force the shell down. Idempotent and never fails.
    ///
    /// Returns without waiting for the shell to finish: a native routine is
    /// asked to stop through its cancel token, a process is killed. The exit
    /// callback is not invoked by this call, though a shell that was already
    /// on its way out may still deliver it.
    pub fn destroy(&mut self) {
        self.control.destroy();
    }
}

impl Drop for Shell {
    fn drop(&mut self) {
        self.control.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{pipe, PipeReader, PipeWriter};
    use crate::session::{ServerSession, SessionInfo};
    use std::io::{self, BufRead, BufReader};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};
    use tokio::sync::oneshot;

    /// Writes a greeting and exits with a fixed status.
    struct Greeter {
        status: i32,
    }

    impl NativeShell for Greeter {
        fn run(&mut self, mut io: ShellIo, env: Arc<Environment>) -> Result<i32, ShellError> {
            let user = env.user().unwrap_or_else(|| "nobody".to_string());
            writeln!(io.output, "hello {user}")?;
            writeln!(io.error, "bye")?;
            Ok(self.status)
        }
    }

    /// Runs until cancelled.
    struct Sleeper;

    impl NativeShell for Sleeper {
        fn run(&mut self, io: ShellIo, _env: Arc<Environment>) -> Result<i32, ShellError> {
            while !io.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(130)
        }
    }

    struct Failing;

    impl NativeShell for Failing {
        fn prepare(&mut self, _env: &Environment) -> Result<(), ShellError> {
            Err(ShellError::StartFailed("no interpreter".to_string()))
        }

        fn run(&mut self, _io: ShellIo, _env: Arc<Environment>) -> Result<i32, ShellError> {
            unreachable!("run after failed prepare")
        }
    }

    struct Panicking;

    impl NativeShell for Panicking {
        fn run(&mut self, _io: ShellIo, _env: Arc<Environment>) -> Result<i32, ShellError> {
            panic!("shell bug")
        }
    }

    struct Erroring;

    impl NativeShell for Erroring {
        fn run(&mut self, mut io: ShellIo, _env: Arc<Environment>) -> Result<i32, ShellError> {
            io.output.write_all(b"partial")?;
            Err(ShellError::Io(io::Error::new(io::ErrorKind::Other, "boom")))
        }
    }

    /// Writes until the output stream refuses.
    struct Flooder;

    impl NativeShell for Flooder {
        fn run(&mut self, mut io: ShellIo, _env: Arc<Environment>) -> Result<i32, ShellError> {
            loop {
                io.output.write_all(&[b'x'; 1024])?;
            }
        }
    }

    /// Blocks in prepare until released.
    struct SlowPrepare {
        release: mpsc::Receiver<()>,
        entered: mpsc::Sender<()>,
    }

    impl NativeShell for SlowPrepare {
        fn prepare(&mut self, _env: &Environment) -> Result<(), ShellError> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(())
        }

        fn run(&mut self, _io: ShellIo, _env: Arc<Environment>) -> Result<i32, ShellError> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct Nosy {
        session: Option<Arc<dyn ServerSession>>,
    }

    impl SessionAware for Nosy {
        fn set_session(&mut self, session: Arc<dyn ServerSession>) {
            self.session = Some(session);
        }
    }

    impl NativeShell for Nosy {
        fn run(&mut self, mut io: ShellIo, _env: Arc<Environment>) -> Result<i32, ShellError> {
            let name = self
                .session
                .as_ref()
                .map(|s| s.username().to_string())
                .unwrap_or_default();
            writeln!(io.output, "session user {name}")?;
            Ok(0)
        }

        fn session_aware(&mut self) -> Option<&mut dyn SessionAware> {
            Some(self)
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

    fn wait_exit(rx: &mut oneshot::Receiver<i32>, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        loop {
            match rx.try_recv() {
                Ok(status) => return Some(status),
                Err(oneshot::error::TryRecvError::Closed) => return None,
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
            if Instant::now() > deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn env_with_user(user: &str) -> Arc<Environment> {
        let mut builder = crate::EnvironmentBuilder::new();
        builder.var(crate::ENV_USER, user);
        builder.build()
    }

    #[test]
    fn test_configured_after_all_four_setters() {
        let mut shell = Shell::native(Greeter { status: 0 });
        assert_eq!(shell.state(), ShellState::Created);

        let (in_r, _in_w) = pipe();
        let (_out_r, out_w) = pipe();
        let (_err_r, err_w) = pipe();
        let (callback, _exit) = ExitCallback::channel();

        // Order among setters is free.
        shell.set_exit_callback(callback);
        shell.set_error_stream(Box::new(err_w));
        assert_eq!(shell.state(), ShellState::Created);
        shell.set_output_stream(Box::new(out_w));
        shell.set_input_stream(Box::new(in_r));
        assert_eq!(shell.state(), ShellState::Configured);
    }

    #[test]
    fn test_start_unconfigured_fails_fast() {
        let mut shell = Shell::native(Greeter { status: 0 });
        let (_out_r, out_w) = pipe();
        shell.set_output_stream(Box::new(out_w));

        let err = shell.start(Arc::new(Environment::default())).unwrap_err();
        assert!(matches!(err, ShellError::NotConfigured("input stream")));
        assert_eq!(shell.state(), ShellState::Created);
    }

    #[test]
    fn test_native_runs_and_exits_once() {
        let mut shell = Shell::native(Greeter { status: 7 });
        let mut wired = wire(&mut shell);

        shell.start(env_with_user("alice")).unwrap();
        assert_eq!(wait_exit(&mut wired.exit, Duration::from_secs(3)), Some(7));
        assert_eq!(shell.state(), ShellState::Exited);

        let mut line = String::new();
        BufReader::new(&mut wired.stdout).read_line(&mut line).unwrap();
        assert_eq!(line, "hello alice\n");
        let mut err = String::new();
        BufReader::new(&mut wired.stderr).read_line(&mut err).unwrap();
        assert_eq!(err, "bye\n");
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut shell = Shell::native(Sleeper);
        let _wired = wire(&mut shell);
        shell.start(Arc::new(Environment::default())).unwrap();

        let err = shell.start(Arc::new(Environment::default())).unwrap_err();
        assert!(matches!(err, ShellError::AlreadyStarted));
        shell.destroy();
    }

    #[test]
    fn test_startup_failure_never_fires_exit() {
        let mut shell = Shell::native(Failing);
        let mut wired = wire(&mut shell);

        let err = shell.start(Arc::new(Environment::default())).unwrap_err();
        assert!(matches!(err, ShellError::StartFailed(_)));
        assert_eq!(
            wired.exit.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        );
        assert_eq!(shell.state(), ShellState::Destroyed);
    }

    #[test]
    fn test_runtime_error_reports_failure_status() {
        let mut shell = Shell::native(Erroring);
        let mut wired = wire(&mut shell);
        shell.start(Arc::new(Environment::default())).unwrap();
        assert_eq!(
            wait_exit(&mut wired.exit, Duration::from_secs(3)),
            Some(FAILURE_EXIT_STATUS)
        );
    }

    #[test]
    fn test_panic_reports_failure_status() {
        let mut shell = Shell::native(Panicking);
        let mut wired = wire(&mut shell);
        shell.start(Arc::new(Environment::default())).unwrap();
        assert_eq!(
            wait_exit(&mut wired.exit, Duration::from_secs(3)),
            Some(FAILURE_EXIT_STATUS)
        );
        assert_eq!(shell.state(), ShellState::Exited);
    }

    #[test]
    fn test_write_to_closed_far_end_fails_instead_of_hanging() {
        let mut shell = Shell::native(Flooder);
        let mut wired = wire(&mut shell);
        shell.start(Arc::new(Environment::default())).unwrap();

        drop(wired.stdout);
        assert_eq!(
            wait_exit(&mut wired.exit, Duration::from_secs(3)),
            Some(FAILURE_EXIT_STATUS)
        );
    }

    #[test]
    fn test_destroy_mid_run_is_idempotent_and_at_most_once() {
        let mut shell = Shell::native(Sleeper);
        let mut wired = wire(&mut shell);
        shell.start(Arc::new(Environment::default())).unwrap();
        assert_eq!(shell.state(), ShellState::Running);

        shell.destroy();
        shell.destroy();
        assert_eq!(shell.state(), ShellState::Destroyed);

        // The routine notices cancellation and returns; its single
        // notification is the only one ever seen.
        assert_eq!(wait_exit(&mut wired.exit, Duration::from_secs(3)), Some(130));
        assert!(wired.exit.try_recv().is_err());
        assert_eq!(shell.state(), ShellState::Destroyed);
        drop(wired.stdin);
    }

    #[test]
    fn test_destroy_after_exit_is_noop() {
        let mut shell = Shell::native(Greeter { status: 0 });
        let mut wired = wire(&mut shell);
        shell.start(Arc::new(Environment::default())).unwrap();
        assert_eq!(wait_exit(&mut wired.exit, Duration::from_secs(3)), Some(0));

        shell.destroy();
        shell.destroy();
        assert_eq!(shell.state(), ShellState::Exited);
    }

    #[test]
    fn test_destroy_before_start() {
        let mut shell = Shell::native(Greeter { status: 0 });
        let mut wired = wire(&mut shell);
        shell.destroy();

        let err = shell.start(Arc::new(Environment::default())).unwrap_err();
        assert!(matches!(err, ShellError::Destroyed));
        assert!(wired.exit.try_recv().is_err());
    }

    #[test]
    fn test_destroy_while_start_in_progress() {
        let (release_tx, release_rx) = mpsc::channel();
        let (entered_tx, entered_rx) = mpsc::channel();
        let mut shell = Shell::native(SlowPrepare {
            release: release_rx,
            entered: entered_tx,
        });
        let mut wired = wire(&mut shell);
        let destroyer = shell.destroyer();

        let starter = thread::spawn(move || {
            let result = shell.start(Arc::new(Environment::default()));
            (result, shell.state())
        });

        entered_rx.recv().unwrap();
        destroyer.destroy();
        release_tx.send(()).unwrap();

        let (result, state) = starter.join().unwrap();
        assert!(matches!(result, Err(ShellError::Destroyed)));
        assert_eq!(state, ShellState::Destroyed);
        assert!(wait_exit(&mut wired.exit, Duration::from_millis(100)).is_none());
    }

    #[test]
    fn test_setters_ignored_after_start() {
        let mut shell = Shell::native(Sleeper);
        let _wired = wire(&mut shell);
        shell.start(Arc::new(Environment::default())).unwrap();

        let (callback, mut late) = ExitCallback::channel();
        shell.set_exit_callback(callback);
        assert_eq!(late.try_recv(), Err(oneshot::error::TryRecvError::Closed));
        shell.destroy();
    }

    #[test]
    fn test_session_capability() {
        let mut plain = Shell::native(Greeter { status: 0 });
        assert!(plain.session_aware().is_none());

        let mut nosy = Shell::native(Nosy::default());
        let session: Arc<dyn ServerSession> = Arc::new(SessionInfo {
            id: 9,
            username: "carol".to_string(),
            remote_address: None,
        });
        nosy.session_aware()
            .expect("nosy shell wants a session")
            .set_session(session);

        let mut wired = wire(&mut nosy);
        nosy.start(Arc::new(Environment::default())).unwrap();
        assert_eq!(wait_exit(&mut wired.exit, Duration::from_secs(3)), Some(0));

        let mut line = String::new();
        BufReader::new(&mut wired.stdout).read_line(&mut line).unwrap();
        assert_eq!(line, "session user carol\n");
        assert!(nosy.session_aware().is_none());
    }
}
