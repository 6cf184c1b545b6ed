//! Configuration for slowterm
//!
//! Settings come from, in increasing priority:
//! - built-in defaults
//! - the config file (`$XDG_CONFIG_HOME/slowterm/config.json`, falling back
//!   to `~/.config/slowterm/config.json`)
//! - `SLOWTERM_*` environment variables
//! - command line arguments

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::relay::{Baudrate, RateError};

/// Shell used when neither a command nor `$SHELL` is available
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// CLI arguments for slowterm
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "slowterm")]
#[command(version)]
#[command(about = "Slow down your console", long_about = None)]
#[command(
    after_help = "Runs COMMAND (default: $SHELL, or /bin/bash) on a pseudo-terminal and relays \
                  input and output one byte at a time at the emulated baudrate."
)]
pub struct CliArgs {
    /// Emulated baudrate in bytes per second [default: 9600]
    #[arg(short, long, value_name = "BAUDRATE", allow_negative_numbers = true)]
    pub baudrate: Option<i64>,

    /// Path to custom config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write diagnostics to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Log filter (e.g. warn, debug, slowterm=trace); RUST_LOG takes precedence
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to run, with its arguments
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

/// Program and arguments to start on the PTY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// slowterm configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Emulated baudrate, validated by [`Config::validate`]
    pub baudrate: i64,
    /// Program to run when no command is given; overrides `$SHELL`
    pub shell: Option<String>,
    /// Default log filter
    pub log_level: String,
    /// Log to this file instead of stderr
    pub log_file: Option<PathBuf>,
    /// Command from the command line
    #[serde(skip)]
    pub command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            baudrate: i64::from(Baudrate::DEFAULT.get()),
            shell: None,
            log_level: "warn".to_string(),
            log_file: None,
            command: Vec::new(),
        }
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },

    #[error("Invalid baudrate: {0}")]
    Baudrate(#[from] RateError),
}

impl Config {
    /// Load configuration with full precedence:
    /// CLI args > environment variables > config file > defaults
    pub fn load_with_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let lookup = |key: &str| env::var(key).ok();

        let mut config = match &args.config {
            // An explicitly requested file must load
            Some(path) => Self::load_from_file(path)?,
            None => match Self::default_config_path(lookup) {
                Some(path) if path.exists() => Self::load_from_file(&path).unwrap_or_else(|e| {
                    // Logging is not up yet; this is the only diagnostic channel.
                    eprintln!("slowterm: ignoring config file: {e}");
                    Self::default()
                }),
                _ => Self::default(),
            },
        };

        config.apply_env_vars(lookup)?;
        config.apply_cli_args(args);
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get the configuration file path
    pub fn default_config_path<F>(lookup: F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = lookup("XDG_CONFIG_HOME")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .or_else(|| lookup("HOME").map(|home| PathBuf::from(home).join(".config")))?;
        Some(base.join("slowterm").join("config.json"))
    }

    /// Apply `SLOWTERM_*` environment variables to config
    fn apply_env_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("SLOWTERM_BAUDRATE") {
            self.baudrate = val.trim().parse().map_err(|_| ConfigError::Env {
                var: "SLOWTERM_BAUDRATE",
                value: val.clone(),
            })?;
        }
        if let Some(val) = lookup("SLOWTERM_LOG_LEVEL") {
            self.log_level = val;
        }
        if let Some(val) = lookup("SLOWTERM_LOG_FILE") {
            self.log_file = Some(PathBuf::from(val));
        }
        Ok(())
    }

    /// Apply CLI arguments to config
    fn apply_cli_args(&mut self, args: &CliArgs) {
        if let Some(baudrate) = args.baudrate {
            self.baudrate = baudrate;
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
        if let Some(path) = &args.log_file {
            self.log_file = Some(path.clone());
        }
        if !args.command.is_empty() {
            self.command = args.command.clone();
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate().map(|_| ())
    }

    /// The configured rate
    pub fn rate(&self) -> Result<Baudrate, ConfigError> {
        Ok(Baudrate::new(self.baudrate)?)
    }

    /// Decide what to run: the given command, else the configured shell,
    /// else `$SHELL`, else [`DEFAULT_SHELL`].
    pub fn resolve_command(&self, env_shell: Option<String>) -> CommandLine {
        if let Some((program, args)) = self.command.split_first() {
            return CommandLine::new(program.clone(), args.to_vec());
        }
        let shell = self
            .shell
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| env_shell.filter(|s| !s.is_empty()))
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());
        CommandLine::new(shell, Vec::new())
    }
}
