use crate::shell::Shell;

/// Produces a fresh, unstarted [`Shell`] for every shell channel request.
///
/// Creation cannot fail. Anything fallible belongs in `Shell::start`.
pub trait ShellFactory: Send + Sync {
    fn create_shell(&self) -> Shell;
}

impl<F> ShellFactory for F
where
    F: Fn() -> Shell + Send + Sync,
{
    fn create_shell(&self) -> Shell {
        self()
    }
}
