//! SIGWINCH subscription
//!
//! The listener blocks SIGWINCH on the thread that starts it, so every
//! thread spawned afterwards inherits the block, and a dedicated thread
//! picks the signal up synchronously with `sigwait`. No handler code runs
//! in signal context.

use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::sys::pthread::pthread_kill;
use nix::sys::signal::{SigSet, Signal};

use crate::resize::ResizeNotifier;

/// Error type for the signal subscription
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("Failed to block SIGWINCH: {0}")]
    Block(#[source] Errno),

    #[error("Failed to start signal thread: {0}")]
    Spawn(#[source] std::io::Error),
}

fn winch_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGWINCH);
    set
}

/// Forwards SIGWINCH deliveries to a [`ResizeNotifier`]
pub struct WinchListener {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WinchListener {
    /// Subscribe to SIGWINCH. Call this before spawning the threads that
    /// should not see the signal; [`WinchListener::stop`] must run on the
    /// same thread to undo the block.
    pub fn start(notifier: ResizeNotifier) -> Result<Self, SignalError> {
        let set = winch_set();
        set.thread_block().map_err(SignalError::Block)?;

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("slowterm-winch".to_string())
            .spawn(move || loop {
                match set.wait() {
                    Ok(_) if flag.load(Ordering::Acquire) => break,
                    Ok(_) => {
                        if !notifier.notify() {
                            break;
                        }
                    },
                    Err(Errno::EINTR) => {},
                    Err(e) => {
                        tracing::warn!("sigwait failed, window size changes will be missed: {}", e);
                        break;
                    },
                }
            });

        match spawned {
            Ok(thread) => Ok(Self {
                stop,
                thread: Some(thread),
            }),
            Err(e) => {
                let _ = winch_set().thread_unblock();
                Err(SignalError::Spawn(e))
            },
        }
    }

    /// Unsubscribe and wait for the listener thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        // Wake the sigwait with a signal aimed at that thread alone. If the
        // thread already exited this fails, which is fine.
        let _ = pthread_kill(thread.as_pthread_t(), Signal::SIGWINCH);
        if thread.join().is_err() {
            tracing::warn!("SIGWINCH listener panicked");
        }
        if let Err(e) = winch_set().thread_unblock() {
            tracing::warn!("failed to unblock SIGWINCH: {}", e);
        }
    }
}

impl Drop for WinchListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}
