//! Unix PTY implementation
//!
//! Implements PTY creation and child process startup using POSIX APIs.

use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc::{self, c_char, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{dup2, fork, pipe2, setsid, ForkResult};

use super::child::Child;
use super::{PtyError, PtyResult, WindowSize};

/// Signals whose disposition is reset before exec. SIGPIPE matters most:
/// the Rust runtime ignores it and ignored dispositions survive exec.
const RESET_SIGNALS: [Signal; 8] = [
    Signal::SIGPIPE,
    Signal::SIGWINCH,
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGALRM,
];

/// Steps the forked child reports back when they fail.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum ChildStage {
    Setsid = 1,
    OpenSlave = 2,
    ControllingTerminal = 3,
    Dup2 = 4,
    Exec = 5,
}

impl ChildStage {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ChildStage::Setsid),
            2 => Some(ChildStage::OpenSlave),
            3 => Some(ChildStage::ControllingTerminal),
            4 => Some(ChildStage::Dup2),
            5 => Some(ChildStage::Exec),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ChildStage::Setsid => "setsid",
            ChildStage::OpenSlave => "open slave",
            ChildStage::ControllingTerminal => "set controlling terminal",
            ChildStage::Dup2 => "dup2",
            ChildStage::Exec => "exec",
        }
    }
}

/// The controlling side of a pseudoterminal whose subordinate side runs a child
pub struct Pty {
    /// The PTY master file descriptor
    master: PtyMaster,
}

impl Pty {
    /// Spawn `program` with `args` on a fresh PTY of the given size.
    ///
    /// The program is looked up in `PATH` and inherits the environment.
    /// A program that cannot be executed is reported here, not as an
    /// exit status, because the child sends its exec errno back over a
    /// close-on-exec pipe.
    pub fn spawn(program: &str, args: &[String], size: WindowSize) -> PtyResult<(Self, Child)> {
        // Everything the child touches is allocated before fork.
        let program_c =
            CString::new(program).map_err(|_| PtyError::InvalidCommand(program.to_string()))?;
        let mut argv_owned = Vec::with_capacity(args.len() + 1);
        argv_owned.push(program_c.clone());
        for arg in args {
            let arg_c =
                CString::new(arg.as_str()).map_err(|_| PtyError::InvalidCommand(arg.clone()))?;
            argv_owned.push(arg_c);
        }
        let mut argv: Vec<*const c_char> = argv_owned.iter().map(|a| a.as_ptr()).collect();
        argv.push(ptr::null());

        keep_child_statuses()?;

        let master = open_master()?;
        grantpt(&master).map_err(PtyError::GrantPty)?;
        unlockpt(&master).map_err(PtyError::UnlockPty)?;
        let slave_path = CString::new(slave_name(&master)?)
            .map_err(|_| PtyError::PtsName(Errno::EINVAL))?;

        set_window_size(master.as_raw_fd(), size)?;

        let (status_read, status_write) = pipe2(OFlag::O_CLOEXEC).map_err(PtyError::StatusPipe)?;

        // SAFETY: the child only performs async-signal-safe calls on
        // memory prepared above before exec'ing or exiting.
        match unsafe { fork() }.map_err(PtyError::Fork)? {
            ForkResult::Child => {
                drop(status_read);
                exec_child(&slave_path, &argv, &status_write)
            },
            ForkResult::Parent { child } => {
                drop(status_write);
                let mut child = Child::new(child);

                let mut report = Vec::new();
                File::from(status_read).read_to_end(&mut report)?;
                if let Some((stage, errno)) = decode_report(&report) {
                    // The child has already exited; collect it.
                    let _ = child.wait();
                    return Err(match stage {
                        ChildStage::Exec => PtyError::Exec {
                            program: program.to_string(),
                            source: errno,
                        },
                        other => PtyError::ChildSetup {
                            stage: other.name(),
                            source: errno,
                        },
                    });
                }

                tracing::debug!("spawned {} (pid {}) on {}", program, child.pid(), size);
                Ok((Pty { master }, child))
            },
        }
    }

    /// Independent handle for reading child output.
    pub fn try_clone_reader(&self) -> io::Result<File> {
        Ok(File::from(self.master.as_fd().try_clone_to_owned()?))
    }

    /// Independent handle for writing child input.
    pub fn try_clone_writer(&self) -> io::Result<File> {
        Ok(File::from(self.master.as_fd().try_clone_to_owned()?))
    }

    /// Independent owned descriptor, e.g. for resizing from another thread.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.master.as_fd().try_clone_to_owned()
    }

    /// Resize the PTY
    pub fn resize(&self, size: WindowSize) -> PtyResult<()> {
        set_window_size(self.master.as_raw_fd(), size)
    }

    /// Current PTY window size
    pub fn window_size(&self) -> PtyResult<WindowSize> {
        get_window_size(self.master.as_raw_fd())
    }
}

impl AsFd for Pty {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

impl AsRawFd for Pty {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

/// Open the master side. The exec'd program must not inherit it.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_master() -> PtyResult<PtyMaster> {
    posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC).map_err(PtyError::OpenMaster)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_master() -> PtyResult<PtyMaster> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    // posix_openpt rejects O_CLOEXEC here
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(PtyError::OpenMaster)?;
    fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(PtyError::CloseOnExec)?;
    Ok(master)
}

/// Undo an inherited `SIGCHLD` ignore (or `SA_NOCLDWAIT`), under which the
/// kernel discards exit statuses and `waitpid` can only fail with ECHILD.
/// Any other disposition is put back untouched.
fn keep_child_statuses() -> PtyResult<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: SIG_DFL runs no handler code; a previous handler is
    // reinstated exactly as it was.
    let previous =
        unsafe { signal::sigaction(Signal::SIGCHLD, &default) }.map_err(PtyError::SigChld)?;
    let discards = previous.handler() == SigHandler::SigIgn
        || previous.flags().contains(SaFlags::SA_NOCLDWAIT);
    if discards {
        tracing::debug!("SIGCHLD was ignored, restored default disposition");
    } else {
        // SAFETY: see above
        unsafe { signal::sigaction(Signal::SIGCHLD, &previous) }.map_err(PtyError::SigChld)?;
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: &PtyMaster) -> PtyResult<String> {
    nix::pty::ptsname_r(master).map_err(PtyError::PtsName)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn slave_name(master: &PtyMaster) -> PtyResult<String> {
    // SAFETY: ptsname uses a static buffer; the result is copied out
    // immediately.
    unsafe { nix::pty::ptsname(master) }.map_err(PtyError::PtsName)
}

/// Runs in the forked child. Never returns.
fn exec_child(slave_path: &CStr, argv: &[*const c_char], status: &OwnedFd) -> ! {
    if setsid().is_err() {
        report_and_exit(status, ChildStage::Setsid);
    }

    // SAFETY: slave_path is a valid NUL-terminated string.
    let slave_fd = unsafe { libc::open(slave_path.as_ptr(), libc::O_RDWR) };
    if slave_fd < 0 {
        report_and_exit(status, ChildStage::OpenSlave);
    }

    // SAFETY: TIOCSCTTY is a valid ioctl for setting the controlling terminal
    if unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) } < 0 {
        report_and_exit(status, ChildStage::ControllingTerminal);
    }

    for target in [STDIN_FILENO, STDOUT_FILENO, STDERR_FILENO] {
        if dup2(slave_fd, target).is_err() {
            report_and_exit(status, ChildStage::Dup2);
        }
    }
    if slave_fd > STDERR_FILENO {
        // SAFETY: slave_fd was opened above and is not used again.
        unsafe { libc::close(slave_fd) };
    }

    for sig in RESET_SIGNALS {
        // SAFETY: restoring default dispositions installs no handler code.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
    let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);

    // SAFETY: argv is a NULL-terminated array of pointers into CStrings
    // that outlive this call.
    unsafe { libc::execvp(argv[0], argv.as_ptr()) };
    report_and_exit(status, ChildStage::Exec)
}

fn report_and_exit(status: &OwnedFd, stage: ChildStage) -> ! {
    let errno = Errno::last_raw();
    let mut message = [0u8; 5];
    message[0] = stage as u8;
    message[1..].copy_from_slice(&errno.to_ne_bytes());
    // SAFETY: writes a stack buffer to a descriptor we own, then exits
    // without running destructors or atexit handlers.
    unsafe {
        libc::write(status.as_raw_fd(), message.as_ptr().cast(), message.len());
        libc::_exit(127)
    }
}

fn decode_report(report: &[u8]) -> Option<(ChildStage, Errno)> {
    if report.len() < 5 {
        return None;
    }
    let stage = ChildStage::from_u8(report[0])?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&report[1..5]);
    Some((stage, Errno::from_raw(i32::from_ne_bytes(raw))))
}

/// Set the window size on a terminal file descriptor
pub fn set_window_size(fd: RawFd, size: WindowSize) -> PtyResult<()> {
    let winsize = size.to_winsize();

    // SAFETY: TIOCSWINSZ is a valid ioctl for setting window size
    let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &winsize) };

    if result < 0 {
        Err(PtyError::SetWinsize(Errno::last()))
    } else {
        Ok(())
    }
}

/// Get the window size from a terminal file descriptor
pub fn get_window_size(fd: RawFd) -> PtyResult<WindowSize> {
    let mut winsize = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: TIOCGWINSZ is a valid ioctl for getting window size
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut winsize) };

    if result < 0 {
        Err(PtyError::GetWinsize(Errno::last()))
    } else {
        Ok(WindowSize::from_winsize(winsize))
    }
}
