//! PTY (Pseudoterminal) handling
//!
//! This module provides functionality for creating pseudoterminals,
//! spawning a child process on the subordinate side, and handing out
//! the controlling side as plain byte streams.

mod child;
#[cfg(unix)]
mod unix;

pub use child::{Child, ChildStatus};
#[cfg(unix)]
pub use unix::{get_window_size, set_window_size, Pty};

use nix::errno::Errno;

/// Error type for PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Failed to open PTY master: {0}")]
    OpenMaster(#[source] Errno),

    #[error("Failed to grant PTY access: {0}")]
    GrantPty(#[source] Errno),

    #[error("Failed to unlock PTY: {0}")]
    UnlockPty(#[source] Errno),

    #[error("Failed to get PTY slave name: {0}")]
    PtsName(#[source] Errno),

    #[error("Failed to create exec status pipe: {0}")]
    StatusPipe(#[source] Errno),

    #[error("Command contains an interior NUL byte: {0:?}")]
    InvalidCommand(String),

    #[error("Failed to mark PTY master close-on-exec: {0}")]
    CloseOnExec(#[source] Errno),

    #[error("Failed to reset SIGCHLD disposition: {0}")]
    SigChld(#[source] Errno),

    #[error("Failed to fork: {0}")]
    Fork(#[source] Errno),

    #[error("Failed to prepare child ({stage}): {source}")]
    ChildSetup {
        stage: &'static str,
        #[source]
        source: Errno,
    },

    #[error("Failed to execute {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: Errno,
    },

    #[error("Failed to set window size: {0}")]
    SetWinsize(#[source] Errno),

    #[error("Failed to get window size: {0}")]
    GetWinsize(#[source] Errno),

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] Errno),

    #[error("Failed to signal child: {0}")]
    Signal(#[source] Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PtyError {
    /// Whether the OS failed to provide a pseudoterminal pair, as opposed
    /// to failing to start the child on it.
    pub fn is_allocation(&self) -> bool {
        matches!(
            self,
            PtyError::OpenMaster(_)
                | PtyError::GrantPty(_)
                | PtyError::UnlockPty(_)
                | PtyError::PtsName(_)
        )
    }
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Window size for PTY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl WindowSize {
    /// Create a new window size with just rows and columns
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// A zero-sized window is what the kernel reports for a pty nobody resized.
    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    fn to_winsize(self) -> nix::libc::winsize {
        nix::libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }

    fn from_winsize(ws: nix::libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl std::fmt::Display for WindowSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}
