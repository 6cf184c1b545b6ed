//! Raw mode for the invoking terminal
//!
//! [`TerminalMode`] snapshots the terminal attributes, switches the
//! terminal to raw mode and puts the snapshot back exactly once, either
//! through [`TerminalMode::restore`] or when dropped.

use std::io;
use std::os::fd::{AsFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices, Termios};

/// Error type for terminal mode changes
#[derive(Debug, thiserror::Error)]
pub enum ModeError {
    #[error("input is not a terminal")]
    NotATerminal,

    #[error("Failed to duplicate terminal descriptor: {0}")]
    Dup(#[source] io::Error),

    #[error("Failed to read terminal attributes: {0}")]
    GetAttributes(#[source] Errno),

    #[error("Failed to set terminal attributes: {0}")]
    SetAttributes(#[source] Errno),
}

/// A terminal held in raw mode, remembering how it was before
pub struct TerminalMode {
    fd: OwnedFd,
    saved: Option<Termios>,
}

impl TerminalMode {
    /// Switch `fd` to raw mode: no line buffering, no echo, no
    /// signal-generating characters, reads return after one byte.
    pub fn engage<Fd: AsFd>(fd: Fd) -> Result<Self, ModeError> {
        let fd = fd.as_fd().try_clone_to_owned().map_err(ModeError::Dup)?;

        let saved = match termios::tcgetattr(&fd) {
            Ok(saved) => saved,
            Err(Errno::ENOTTY) => return Err(ModeError::NotATerminal),
            Err(e) => return Err(ModeError::GetAttributes(e)),
        };

        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::tcsetattr(&fd, SetArg::TCSANOW, &raw).map_err(ModeError::SetAttributes)?;

        tracing::debug!("terminal switched to raw mode");
        Ok(Self {
            fd,
            saved: Some(saved),
        })
    }

    /// Put the saved attributes back. Only the first call does anything;
    /// returns whether this call restored the terminal. Failures are
    /// logged, never returned: this runs during teardown.
    pub fn restore(&mut self) -> bool {
        let Some(saved) = self.saved.take() else {
            return false;
        };
        match termios::tcsetattr(&self.fd, SetArg::TCSANOW, &saved) {
            Ok(()) => tracing::debug!("terminal mode restored"),
            Err(e) => tracing::warn!("failed to restore terminal mode: {}", e),
        }
        true
    }
}

impl Drop for TerminalMode {
    fn drop(&mut self) {
        self.restore();
    }
}
