use tokio::sync::oneshot;

/// Single-use notification the shell fires when it exits.
///
/// `on_exit` consumes the callback, so a shell cannot deliver two exit
/// statuses through the same callback.
pub struct ExitCallback {
    notify: Box<dyn FnOnce(i32) + Send>,
}

impl ExitCallback {
    pub fn new<F>(notify: F) -> Self
    where
        F: FnOnce(i32) + Send + 'static,
    {
        Self {
            notify: Box::new(notify),
        }
    }

    /// A callback paired with a receiver that resolves to the exit status.
    ///
    /// The receiver resolves to an error if the callback is dropped without
    /// firing (startup failure or forced teardown).
    pub fn channel() -> (Self, oneshot::Receiver<i32>) {
        let (tx, rx) = oneshot::channel();
        let callback = Self::new(move |status| {
            // Receiver gone means nobody is waiting on this channel anymore.
            let _ = tx.send(status);
        });
        (callback, rx)
    }

    /// Tell the server the shell has exited.
    pub fn on_exit(self, status: i32) {
        log::debug!("shell exited with status {status}");
        (self.notify)(status)
    }
}

impl std::fmt::Debug for ExitCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExitCallback")
    }
}
