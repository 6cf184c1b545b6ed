//! Application glue module
//!
//! Configuration, logging, and command resolution for the binary.

mod config;
pub mod logging;

pub use config::{CliArgs, CommandLine, Config, ConfigError, DEFAULT_SHELL};
