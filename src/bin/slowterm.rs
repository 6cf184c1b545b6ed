//! slowterm - Slow down your console
//!
//! Runs a shell or the given command with an emulated baudrate applied to
//! both its input and its output.

use std::env;
use std::process::ExitCode;

use clap::Parser;

use slowterm::app::{self, CliArgs, Config};
use slowterm::session::{self, SessionConfig, Terminal};

fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Load configuration with precedence: CLI > env > file > defaults
    let config = match Config::load_with_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("slowterm: {}", e);
            return ExitCode::FAILURE;
        },
    };

    if let Err(e) = app::logging::init(&config) {
        eprintln!("slowterm: {}", e);
    }

    let command = config.resolve_command(env::var("SHELL").ok());
    let session_config = match SessionConfig::new(command, config.baudrate) {
        Ok(session_config) => session_config,
        Err(e) => {
            report_error(&config, &e);
            return ExitCode::FAILURE;
        },
    };

    let result = Terminal::stdio()
        .map_err(session::SessionError::from)
        .and_then(|terminal| session::run(&session_config, terminal));

    match result {
        Ok(report) => {
            let code = report.status.exit_code();
            tracing::debug!("exiting with status {}", code);
            ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
        },
        Err(e) => {
            report_error(&config, &e);
            ExitCode::FAILURE
        },
    }
}

/// Print a fatal error once: on stderr, and in the log file if there is one.
fn report_error(config: &Config, e: &dyn std::error::Error) {
    if !app::logging::writes_to_stderr(config) {
        tracing::error!("{}", e);
    }
    eprintln!("slowterm: {}", e);
}
