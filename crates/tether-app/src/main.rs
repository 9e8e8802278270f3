//! `tether`: hosts one shell channel over the local terminal.
//!
//! The process's own stdio plays the client side of the channel and OS
//! signals play the client's signal requests, which makes it a loopback
//! transport for trying shells out.

mod config;
mod term;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;

use config::{AppConfig, ConfigError, ShellKind};
use tether_pty::ProcessShellFactory;
use tether_shell::{
    ChannelStreams, EchoShellFactory, SessionInfo, ShellChannel, ShellError, ShellFactory, Signal,
    ENV_USER, FAILURE_EXIT_STATUS,
};

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Run a shell channel on the local terminal")]
struct Cli {
    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Program to run instead of the configured or default shell.
    #[arg(long)]
    shell: Option<String>,

    /// Run the built-in echo shell.
    #[arg(long, conflicts_with = "shell")]
    echo: bool,

    /// Connect the program through pipes instead of a PTY.
    #[arg(long)]
    no_pty: bool,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(shell) = &self.shell {
            config.shell = ShellKind::Process;
            config.command = Some(shell.clone());
        }
        if self.echo {
            config.shell = ShellKind::Echo;
        }
        if self.no_pty {
            config.pty = false;
        }
    }
}

#[derive(Debug)]
enum AppError {
    Config(ConfigError),
    Shell(ShellError),
    Io(std::io::Error),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Config(e) => write!(f, "{e}"),
            AppError::Shell(e) => write!(f, "shell: {e}"),
            AppError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(e) => Some(e),
            AppError::Shell(e) => Some(e),
            AppError::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::Config(e)
    }
}

impl From<ShellError> for AppError {
    fn from(e: ShellError) -> Self {
        AppError::Shell(e)
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e)
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let status = match run(Cli::parse()).await {
        Ok(status) => status,
        Err(e) => {
            eprintln!("fatal: {e}");
            1
        }
    };
    std::process::exit(status);
}

async fn run(cli: Cli) -> Result<i32, AppError> {
    let mut config = match &cli.config {
        Some(path) => config::load(path)?,
        None => AppConfig::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    let factory = build_factory(&config);
    let username = std::env::var(ENV_USER).unwrap_or_default();
    let session = Arc::new(SessionInfo {
        id: u64::from(std::process::id()),
        username: username.clone(),
        remote_address: None,
    });
    let streams = ChannelStreams {
        input: Box::new(std::io::stdin()),
        output: Box::new(std::io::stdout()),
        error: Box::new(std::io::stderr()),
    };

    let mut channel = ShellChannel::open(1, factory.as_ref(), session, streams);
    if !username.is_empty() {
        channel.env_request(ENV_USER, &username);
    }
    for (name, value) in &config.env {
        channel.env_request(name, value);
    }

    let raw_mode = if config.wants_pty() {
        let term_name = std::env::var("TERM").unwrap_or_else(|_| config.term.clone());
        let (cols, rows) = term::window_size().unwrap_or((config.cols, config.rows));
        channel.pty_request(&term_name, cols, rows);
        if term::stdin_is_tty() {
            Some(term::RawMode::enable()?)
        } else {
            None
        }
    } else {
        None
    };

    channel.start()?;

    let Some(exit_rx) = channel.take_exit_receiver() else {
        return Ok(FAILURE_EXIT_STATUS);
    };
    let status = forward_signals(&channel, exit_rx).await?;
    log::info!("shell exited with status {status}");

    drop(raw_mode);
    Ok(status)
}

fn build_factory(config: &AppConfig) -> Box<dyn ShellFactory> {
    match config.shell {
        ShellKind::Echo => Box::new(EchoShellFactory::with_prompt(config.prompt.clone())),
        ShellKind::Process => {
            let mut factory = ProcessShellFactory::new(config.command.as_deref())
                .args(config.args.clone())
                .mode(config.process_mode());
            if let Some(dir) = &config.working_dir {
                factory = factory.working_dir(dir);
            }
            Box::new(factory)
        }
    }
}

/// Relay OS signals to the channel until the shell reports its status.
async fn forward_signals(
    channel: &ShellChannel,
    mut exit_rx: oneshot::Receiver<i32>,
) -> std::io::Result<i32> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut winch = signal(SignalKind::window_change())?;

    loop {
        tokio::select! {
            status = &mut exit_rx => {
                return Ok(status.unwrap_or(FAILURE_EXIT_STATUS));
            }
            _ = interrupt.recv() => {
                channel.signal(Signal::Int);
            }
            _ = terminate.recv() => {
                channel.signal(Signal::Term);
            }
            _ = hangup.recv() => {
                channel.signal(Signal::Hup);
            }
            _ = quit.recv() => {
                channel.signal(Signal::Quit);
            }
            _ = winch.recv() => {
                match term::window_size() {
                    Some((cols, rows)) => channel.window_change(cols, rows),
                    None => log::debug!("window change but no terminal size"),
                }
            }
        }
    }
}
