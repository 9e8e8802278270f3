//! JSON configuration for the `tether` host.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tether_pty::{ProcessMode, TtyOptions, DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TERM};

pub const DEFAULT_PROMPT: &str = "> ";

/// Which kind of shell the host runs on its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    /// An external program, the user's shell unless `command` is set.
    Process,
    /// The built-in line echo shell.
    Echo,
}

/// Line-discipline emulation for piped processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtyConfig {
    pub echo: bool,
    pub onlcr: bool,
    pub icrnl: bool,
}

impl Default for TtyConfig {
    fn default() -> Self {
        let options = TtyOptions::default();
        Self {
            echo: options.echo,
            onlcr: options.onlcr,
            icrnl: options.icrnl,
        }
    }
}

impl From<TtyConfig> for TtyOptions {
    fn from(config: TtyConfig) -> Self {
        TtyOptions {
            echo: config.echo,
            onlcr: config.onlcr,
            icrnl: config.icrnl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub shell: ShellKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    /// Run the process on a PTY. When false it runs on pipes.
    pub pty: bool,
    pub tty: TtyConfig,
    /// Extra variables sent as if the client had requested them.
    pub env: BTreeMap<String, String>,
    /// Used when the local `TERM` is unset.
    pub term: String,
    /// Used when the local terminal size cannot be read.
    pub cols: u16,
    pub rows: u16,
    pub prompt: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            shell: ShellKind::Process,
            command: None,
            args: Vec::new(),
            working_dir: None,
            pty: true,
            tty: TtyConfig::default(),
            env: BTreeMap::new(),
            term: DEFAULT_TERM.to_string(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cols == 0 || self.rows == 0 {
            return Err(ConfigError::Invalid(format!(
                "terminal size must be non-zero, got {}x{}",
                self.cols, self.rows
            )));
        }
        if self.term.trim().is_empty() {
            return Err(ConfigError::Invalid("term must not be empty".to_string()));
        }
        if matches!(&self.command, Some(c) if c.trim().is_empty()) {
            return Err(ConfigError::Invalid("command must not be empty".to_string()));
        }
        if let Some(key) = self.env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(ConfigError::Invalid(format!("bad variable name {key:?}")));
        }
        Ok(())
    }

    /// Whether the channel should make a PTY request.
    pub fn wants_pty(&self) -> bool {
        self.shell == ShellKind::Process && self.pty
    }

    pub fn process_mode(&self) -> ProcessMode {
        if self.pty {
            ProcessMode::Pty
        } else {
            ProcessMode::Piped(self.tty.into())
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {e}"),
            ConfigError::Parse(e) => write!(f, "cannot parse config: {e}"),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Read and validate a config file. Missing keys take their defaults.
pub fn load(path: &Path) -> Result<AppConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&text)?;
    config.validate()?;
    log::debug!("loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_object_gives_defaults() {
        let file = write_config("{}");
        let config = load(file.path()).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.wants_pty());
        assert_eq!(config.process_mode(), ProcessMode::Pty);
    }

    #[test]
    fn test_partial_config() {
        let file = write_config(
            r#"{
                "command": "/bin/sh",
                "args": ["-i"],
                "pty": false,
                "tty": { "echo": true },
                "env": { "LANG": "C.UTF-8" },
                "cols": 132
            }"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.command.as_deref(), Some("/bin/sh"));
        assert_eq!(config.args, vec!["-i".to_string()]);
        assert_eq!(config.cols, 132);
        assert_eq!(config.rows, DEFAULT_ROWS);
        assert_eq!(config.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert!(!config.wants_pty());
        assert_eq!(
            config.process_mode(),
            ProcessMode::Piped(TtyOptions {
                echo: true,
                onlcr: true,
                icrnl: false,
            })
        );
    }

    #[test]
    fn test_echo_shell_never_wants_pty() {
        let file = write_config(r#"{ "shell": "echo", "prompt": "$ " }"#);
        let config = load(file.path()).unwrap();
        assert_eq!(config.shell, ShellKind::Echo);
        assert_eq!(config.prompt, "$ ");
        assert!(!config.wants_pty());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_malformed_json() {
        let file = write_config("{ \"pty\": ");
        let err = load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().starts_with("cannot parse config"));
    }

    #[test]
    fn test_unknown_shell_kind_is_parse_error() {
        let file = write_config(r#"{ "shell": "zsh" }"#);
        assert!(matches!(load(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validation() {
        let file = write_config(r#"{ "rows": 0 }"#);
        assert!(matches!(load(file.path()), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.command = Some("  ".to_string());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.env.insert("A=B".to_string(), "x".to_string());
        assert!(config.validate().is_err());
    }
}
