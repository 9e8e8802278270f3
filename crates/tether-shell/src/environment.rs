//! Negotiated environment variables and the per-channel signal registry.
//!
//! The server builds an [`Environment`] once per channel with an
//! [`EnvironmentBuilder`] and hands it to the shell. After that the variables
//! are read-only to the shell; the listener registry is the only state both
//! sides mutate, so it sits behind its own lock.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use crate::signal::{Signal, SignalListener};

/// Remote identity negotiated by the client.
pub const ENV_USER: &str = "USER";
/// Visible rows on the client. Together with [`ENV_COLUMNS`] the screen size.
pub const ENV_LINES: &str = "LINES";
/// Visible columns on the client.
pub const ENV_COLUMNS: &str = "COLUMNS";
/// Terminal type in use on the client.
pub const ENV_TERM: &str = "TERM";

type Listener = Arc<dyn SignalListener>;

fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn push_unique(list: &mut Vec<Listener>, listener: &Listener) {
    if !list.iter().any(|l| same_listener(l, listener)) {
        list.push(Arc::clone(listener));
    }
}

#[derive(Default)]
struct Registry {
    by_signal: HashMap<Signal, Vec<Listener>>,
    all: Vec<Listener>,
}

impl Registry {
    /// Listeners for one occurrence of `signal`: specific tier first, then
    /// catch-all, each identity once.
    fn targets(&self, signal: Signal) -> Vec<Listener> {
        let mut out: Vec<Listener> = Vec::new();
        if let Some(specific) = self.by_signal.get(&signal) {
            for l in specific {
                push_unique(&mut out, l);
            }
        }
        for l in &self.all {
            push_unique(&mut out, l);
        }
        out
    }

    fn remove(&mut self, listener: &Listener) {
        for list in self.by_signal.values_mut() {
            list.retain(|l| !same_listener(l, listener));
        }
        self.by_signal.retain(|_, list| !list.is_empty());
        self.all.retain(|l| !same_listener(l, listener));
    }

    fn len(&self) -> usize {
        self.by_signal.values().map(Vec::len).sum::<usize>() + self.all.len()
    }
}

/// Environment handed to a shell on `start`.
pub struct Environment {
    vars: RwLock<HashMap<String, String>>,
    registry: Mutex<Registry>,
}

impl Environment {
    /// An environment with the given variables and no listeners.
    pub fn new(vars: HashMap<String, String>) -> Self {
        Self {
            vars: RwLock::new(vars),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Snapshot of every negotiated variable.
    pub fn get_env(&self) -> HashMap<String, String> {
        match self.vars.read() {
            Ok(vars) => vars.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// A single variable, `None` when it was never negotiated.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.vars.read() {
            Ok(vars) => vars.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    pub fn user(&self) -> Option<String> {
        self.get(ENV_USER)
    }

    pub fn term(&self) -> Option<String> {
        self.get(ENV_TERM)
    }

    pub fn lines(&self) -> Option<u16> {
        self.get(ENV_LINES).and_then(|v| v.trim().parse().ok())
    }

    pub fn columns(&self) -> Option<u16> {
        self.get(ENV_COLUMNS).and_then(|v| v.trim().parse().ok())
    }

    /// `(cols, rows)` when both halves of the screen size were negotiated.
    pub fn window_size(&self) -> Option<(u16, u16)> {
        Some((self.columns()?, self.lines()?))
    }

    /// Register `listener` for one signal.
    pub fn add_signal_listener(&self, signal: Signal, listener: Arc<dyn SignalListener>) {
        self.add_signal_listeners([signal], listener);
    }

    /// Register `listener` for each signal in `signals`.
    pub fn add_signal_listeners<I>(&self, signals: I, listener: Arc<dyn SignalListener>)
    where
        I: IntoIterator<Item = Signal>,
    {
        let mut registry = self.lock_registry();
        for signal in signals {
            push_unique(registry.by_signal.entry(signal).or_default(), &listener);
        }
    }

    /// Register `listener` for every signal.
    pub fn add_global_signal_listener(&self, listener: Arc<dyn SignalListener>) {
        push_unique(&mut self.lock_registry().all, &listener);
    }

    /// Remove every registration held by `listener`, however it was added.
    pub fn remove_signal_listener(&self, listener: &Arc<dyn SignalListener>) {
        self.lock_registry().remove(listener);
    }

    /// Number of registrations currently held.
    pub fn listener_count(&self) -> usize {
        self.lock_registry().len()
    }

    /// Deliver one occurrence of `signal`.
    ///
    /// Called by the server side when the transport reports a signal. The
    /// registry lock is not held while listeners run, so a listener may
    /// register or remove listeners itself. A panicking listener is logged
    /// and skipped. Returns how many listeners were invoked.
    pub fn signal(&self, signal: Signal) -> usize {
        let targets = self.lock_registry().targets(signal);
        log::debug!("dispatching {signal} to {} listener(s)", targets.len());

        for listener in &targets {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener.signal(signal)));
            if result.is_err() {
                log::warn!("signal listener panicked while handling {signal}");
            }
        }
        targets.len()
    }

    /// Record a new screen size. Server side only: the transport calls this
    /// on a window-change request, then dispatches [`Signal::Winch`].
    pub fn set_window_size(&self, cols: u16, rows: u16) {
        let mut vars = match self.vars.write() {
            Ok(v) => v,
            Err(poisoned) => poisoned.into_inner(),
        };
        vars.insert(ENV_COLUMNS.to_string(), cols.to_string());
        vars.insert(ENV_LINES.to_string(), rows.to_string());
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        // Listeners run outside the lock, so poisoning can only come from a
        // panic inside the registry code itself; the data is still coherent.
        match self.registry.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("vars", &self.get_env())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Server-side construction of an [`Environment`].
#[derive(Default)]
pub struct EnvironmentBuilder {
    vars: HashMap<String, String>,
    pending: Vec<(Option<Vec<Signal>>, Arc<dyn SignalListener>)>,
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable; a later value for the same key replaces the earlier one.
    pub fn var(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Record a PTY request: terminal type and screen size.
    pub fn pty(&mut self, term: &str, cols: u16, rows: u16) -> &mut Self {
        self.var(ENV_TERM, term)
            .var(ENV_COLUMNS, cols.to_string())
            .var(ENV_LINES, rows.to_string())
    }

    /// Queue a subscription that is installed when the environment is built.
    /// `None` subscribes to every signal.
    pub fn listener(
        &mut self,
        signals: Option<Vec<Signal>>,
        listener: Arc<dyn SignalListener>,
    ) -> &mut Self {
        self.pending.push((signals, listener));
        self
    }

    pub fn build(&self) -> Arc<Environment> {
        let env = Environment::new(self.vars.clone());
        for (signals, listener) in &self.pending {
            match signals {
                Some(set) => env.add_signal_listeners(set.iter().copied(), Arc::clone(listener)),
                None => env.add_global_signal_listener(Arc::clone(listener)),
            }
        }
        Arc::new(env)
    }
}
