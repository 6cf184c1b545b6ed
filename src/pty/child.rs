//! Child process management
//!
//! Tracks the process started on the PTY and collects its exit status.

use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use super::{PtyError, PtyResult};

/// How often `reap` polls while waiting out the hangup grace period.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// Exited normally with the given code
    Exited(i32),
    /// Killed by a signal
    Signaled(Signal),
}

impl ChildStatus {
    /// Shell convention: the exit code, or 128 + signal number.
    pub fn exit_code(&self) -> i32 {
        match self {
            ChildStatus::Exited(code) => *code,
            ChildStatus::Signaled(sig) => 128 + *sig as i32,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ChildStatus::Exited(0))
    }
}

impl std::fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildStatus::Exited(code) => write!(f, "exited with code {code}"),
            ChildStatus::Signaled(sig) => write!(f, "killed by {sig}"),
        }
    }
}

/// A child process attached to a PTY
pub struct Child {
    /// The child process ID
    pid: Pid,
    /// Exit status, once collected
    status: Option<ChildStatus>,
}

impl Child {
    pub(crate) fn new(pid: Pid) -> Self {
        Self { pid, status: None }
    }

    /// Get the child process ID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Check if the child has exited (non-blocking)
    pub fn try_wait(&mut self) -> PtyResult<Option<ChildStatus>> {
        if self.status.is_some() {
            return Ok(self.status);
        }
        self.record(waitpid(self.pid, Some(WaitPidFlag::WNOHANG)))
    }

    /// Wait for the child to exit (blocking)
    pub fn wait(&mut self) -> PtyResult<ChildStatus> {
        loop {
            if let Some(status) = self.status {
                return Ok(status);
            }
            if let Some(status) = self.record(waitpid(self.pid, None))? {
                return Ok(status);
            }
        }
    }

    /// Collect the child after its PTY has been closed.
    ///
    /// Closing the master hangs up the child's terminal, which ends most
    /// programs. A child still running is sent SIGHUP and given `grace`
    /// to exit before it is killed.
    pub fn reap(&mut self, grace: Duration) -> PtyResult<ChildStatus> {
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }

        self.signal(Signal::SIGHUP)?;
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = self.try_wait()? {
                return Ok(status);
            }
            thread::sleep(REAP_POLL_INTERVAL);
        }

        tracing::warn!("child {} ignored hangup, killing it", self.pid);
        self.signal(Signal::SIGKILL)?;
        self.wait()
    }

    /// Send a signal to the child process
    pub fn signal(&self, sig: Signal) -> PtyResult<()> {
        if self.status.is_some() {
            return Ok(());
        }
        match signal::kill(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(PtyError::Signal(e)),
        }
    }

    fn record(&mut self, result: nix::Result<WaitStatus>) -> PtyResult<Option<ChildStatus>> {
        let status = match result {
            Ok(WaitStatus::Exited(_, code)) => Some(ChildStatus::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => Some(ChildStatus::Signaled(sig)),
            Ok(_) => None,
            Err(Errno::EINTR) => None,
            // ECHILD means the status was collected elsewhere
            Err(e) => return Err(PtyError::Wait(e)),
        };
        if status.is_some() {
            self.status = status;
        }
        Ok(status)
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        // Try to reap the child process
        if self.status.is_none() {
            let _ = waitpid(self.pid, Some(WaitPidFlag::WNOHANG));
        }
    }
}
