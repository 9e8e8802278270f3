//! Delivering transport signals to child processes as OS signals.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tether_shell::{ProcessKiller, Signal};

/// This platform's number for `signal`, if it has one.
#[allow(unreachable_patterns)]
pub(crate) fn os_signal(signal: Signal) -> Option<libc::c_int> {
    let number = match signal {
        Signal::Hup => libc::SIGHUP,
        Signal::Int => libc::SIGINT,
        Signal::Quit => libc::SIGQUIT,
        Signal::Ill => libc::SIGILL,
        Signal::Trap => libc::SIGTRAP,
        Signal::Iot => libc::SIGABRT,
        Signal::Bus => libc::SIGBUS,
        Signal::Fpe => libc::SIGFPE,
        Signal::Kill => libc::SIGKILL,
        Signal::Usr1 => libc::SIGUSR1,
        Signal::Segv => libc::SIGSEGV,
        Signal::Usr2 => libc::SIGUSR2,
        Signal::Pipe => libc::SIGPIPE,
        Signal::Alrm => libc::SIGALRM,
        Signal::Term => libc::SIGTERM,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Signal::Stkflt => libc::SIGSTKFLT,
        Signal::Chld => libc::SIGCHLD,
        Signal::Cont => libc::SIGCONT,
        Signal::Stop => libc::SIGSTOP,
        Signal::Tstp => libc::SIGTSTP,
        Signal::Ttin => libc::SIGTTIN,
        Signal::Ttou => libc::SIGTTOU,
        Signal::Urg => libc::SIGURG,
        Signal::Xcpu => libc::SIGXCPU,
        Signal::Xfsz => libc::SIGXFSZ,
        Signal::Vtalrm => libc::SIGVTALRM,
        Signal::Prof => libc::SIGPROF,
        Signal::Winch => libc::SIGWINCH,
        Signal::Io => libc::SIGIO,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Signal::Pwr => libc::SIGPWR,
        _ => return None,
    };
    Some(number)
}

/// Send `signal` to process `pid`.
pub(crate) fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if unsafe { libc::kill(pid, signal) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Deliver a transport signal to `pid`, logging anything that goes wrong.
pub(crate) fn forward(pid: u32, signal: Signal) {
    let Some(number) = os_signal(signal) else {
        log::debug!("{signal} has no equivalent on this platform");
        return;
    };
    if let Err(e) = send_signal(pid, number) {
        log::warn!("failed to send {signal} to {pid}: {e}");
    }
}

/// SIGKILLs a child by pid until its exit status has been collected.
pub(crate) struct PidKiller {
    pub(crate) pid: u32,
    pub(crate) reaped: Arc<AtomicBool>,
}

impl ProcessKiller for PidKiller {
    fn kill(&self) {
        if self.reaped.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = send_signal(self.pid, libc::SIGKILL) {
            log::debug!("kill handle for {}: {e}", self.pid);
        }
    }
}
