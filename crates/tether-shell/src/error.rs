/// Exit status reported through the exit callback when a shell fails after
/// it has started (panic in a native routine, lost process, ...).
pub const FAILURE_EXIT_STATUS: i32 = -1;

/// Errors surfaced synchronously by shell operations.
///
/// Everything that goes wrong after a successful `start` is reported through
/// the exit callback instead.
#[derive(Debug)]
pub enum ShellError {
    /// `start` was called before the named piece was set.
    NotConfigured(&'static str),
    AlreadyStarted,
    Destroyed,
    StartFailed(String),
    Io(std::io::Error),
}

impl std::fmt::Display for ShellError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellError::NotConfigured(what) => write!(f, "shell not configured: {what} not set"),
            ShellError::AlreadyStarted => write!(f, "shell already started"),
            ShellError::Destroyed => write!(f, "shell was destroyed"),
            ShellError::StartFailed(msg) => write!(f, "shell failed to start: {msg}"),
            ShellError::Io(err) => write!(f, "shell I/O error: {err}"),
        }
    }
}

impl std::error::Error for ShellError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShellError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ShellError {
    fn from(err: std::io::Error) -> Self {
        ShellError::Io(err)
    }
}
