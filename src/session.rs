//! Throttled terminal session
//!
//! Wires the pieces together: spawn the child on a PTY, put the invoking
//! terminal in raw mode, keep the PTY size in sync, and relay both
//! directions through rate-limited pumps until the child's side of the
//! PTY hangs up.
//!
//! Teardown order is fixed: terminal mode, SIGWINCH subscription, resize
//! worker, PTY, child. Each of those is owned by a guard value, so an
//! early return or a panic releases them too.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::Duration;

use crate::app::CommandLine;
use crate::pty::{get_window_size, ChildStatus, Pty, PtyError};
use crate::relay::{self, Baudrate, PumpReport, RateError, RateLimiter};
use crate::resize::{self, ResizeForwarder, SizeMirror};
use crate::signals::WinchListener;
use crate::term::{ModeError, TerminalMode};

/// How long a child may outlive its PTY before it is killed
const HANGUP_GRACE: Duration = Duration::from_millis(500);

/// Error type for starting a session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    InvalidRate(#[from] RateError),

    #[error("Failed to allocate pseudo-terminal: {0}")]
    PtyAllocation(#[source] PtyError),

    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: PtyError,
    },

    #[error("Failed to enter raw mode: {0}")]
    Mode(#[from] ModeError),

    #[error("Failed to set up relay: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to collect child: {0}")]
    Reap(#[source] PtyError),
}

impl SessionError {
    fn from_pty(command: &CommandLine, err: PtyError) -> Self {
        if err.is_allocation() {
            SessionError::PtyAllocation(err)
        } else {
            SessionError::Spawn {
                command: command.program.clone(),
                source: err,
            }
        }
    }
}

/// What to run and how fast
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub command: CommandLine,
    pub baudrate: Baudrate,
}

impl SessionConfig {
    /// Validates the rate before anything else can happen.
    pub fn new(command: CommandLine, rate: i64) -> Result<Self, SessionError> {
        Ok(Self {
            command,
            baudrate: Baudrate::new(rate)?,
        })
    }
}

/// The invoking terminal's input and output
pub struct Terminal {
    input: OwnedFd,
    output: OwnedFd,
}

impl Terminal {
    /// This process's stdin and stdout.
    pub fn stdio() -> io::Result<Self> {
        Ok(Self {
            input: io::stdin().as_fd().try_clone_to_owned()?,
            output: io::stdout().as_fd().try_clone_to_owned()?,
        })
    }

    pub fn from_fds(input: OwnedFd, output: OwnedFd) -> Self {
        Self { input, output }
    }
}

/// Outcome of a finished session
#[derive(Debug)]
pub struct SessionReport {
    /// How the child ended
    pub status: ChildStatus,
    /// The child-to-terminal direction
    pub output: PumpReport,
}

/// Run `config.command` behind the throttled relay until it hangs up.
///
/// Start failures return before the terminal mode is touched. Once raw
/// mode is engaged, every exit path restores it exactly once.
pub fn run(config: &SessionConfig, terminal: Terminal) -> Result<SessionReport, SessionError> {
    let limiter = RateLimiter::new(config.baudrate);
    let command = &config.command;

    let initial_size = get_window_size(terminal.input.as_raw_fd()).unwrap_or_default();
    let (pty, mut child) = Pty::spawn(&command.program, &command.args, initial_size)
        .map_err(|e| SessionError::from_pty(command, e))?;
    tracing::info!(
        "running {} at {} (pid {})",
        command,
        config.baudrate,
        child.pid()
    );

    let mut mode = match TerminalMode::engage(&terminal.input) {
        Ok(mode) => mode,
        Err(e) => {
            drop(pty);
            if let Err(reap) = child.reap(HANGUP_GRACE) {
                tracing::warn!("failed to reap child: {}", reap);
            }
            return Err(e.into());
        },
    };

    // The listener must block SIGWINCH before any other thread exists.
    let (notifier, events) = resize::channel();
    let listener = match WinchListener::start(notifier.clone()) {
        Ok(listener) => Some(listener),
        Err(e) => {
            tracing::warn!("window size changes will not be forwarded: {}", e);
            None
        },
    };
    let mirror = SizeMirror::new(terminal.input.try_clone()?, pty.try_clone_fd()?);
    let forwarder = ResizeForwarder::spawn(events, mirror)?;
    notifier.notify();

    // The input pump is never joined: it sits in a read on the terminal
    // and goes away with the process.
    let input = File::from(terminal.input.try_clone()?);
    relay::spawn_pump("slowterm-input", pty.try_clone_writer()?, input, limiter)?;

    let mut output = File::from(terminal.output);
    let mut reader = pty.try_clone_reader()?;
    let report = relay::pump(&mut output, &mut reader, &limiter);
    tracing::debug!(
        "output pump stopped after {} bytes ({} paced, {:?} asleep): {}",
        report.bytes,
        report.paced,
        report.slept,
        report.end
    );

    mode.restore();
    if let Some(listener) = listener {
        listener.stop();
    }
    let resizes = forwarder.cancel();
    tracing::debug!("applied {} window size changes", resizes);

    drop(reader);
    drop(pty);
    let status = child.reap(HANGUP_GRACE).map_err(SessionError::Reap)?;
    tracing::info!("{} {}", command, status);

    Ok(SessionReport {
        status,
        output: report,
    })
}
