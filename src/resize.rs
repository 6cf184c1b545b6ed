//! Window size forwarding
//!
//! Size-change notifications flow through an unbounded channel into a
//! worker thread that copies the invoking terminal's dimensions onto the
//! PTY. Every notification triggers a full resize; repeating one is
//! harmless because applying the same size twice changes nothing.
//!
//! Cancelling the forwarder never waits on the notification sources:
//! anything still queued, or sent later, is discarded.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::pty::{get_window_size, set_window_size, PtyError, WindowSize};

/// Error type for a single resize attempt. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ResizeError {
    #[error("Failed to read terminal size: {0}")]
    Query(#[source] PtyError),

    #[error("terminal reports an empty window ({0})")]
    EmptyWindow(WindowSize),

    #[error("Failed to apply size to PTY: {0}")]
    Apply(#[source] PtyError),
}

/// Something whose size follows the invoking terminal
pub trait ResizeTarget: Send + 'static {
    /// Read the current size and apply it, returning what was applied.
    fn sync_size(&mut self) -> Result<WindowSize, ResizeError>;
}

/// Copies the size of one terminal onto a PTY master
pub struct SizeMirror {
    source: OwnedFd,
    pty: OwnedFd,
}

impl SizeMirror {
    pub fn new(source: OwnedFd, pty: OwnedFd) -> Self {
        Self { source, pty }
    }
}

impl ResizeTarget for SizeMirror {
    fn sync_size(&mut self) -> Result<WindowSize, ResizeError> {
        let size = get_window_size(self.source.as_raw_fd()).map_err(ResizeError::Query)?;
        if size.is_empty() {
            return Err(ResizeError::EmptyWindow(size));
        }
        set_window_size(self.pty.as_raw_fd(), size).map_err(ResizeError::Apply)?;
        Ok(size)
    }
}

enum Event {
    SizeChanged,
    Shutdown,
}

/// Sending half of the resize event stream
#[derive(Clone)]
pub struct ResizeNotifier {
    tx: Sender<Event>,
}

impl ResizeNotifier {
    /// Queue a resize. Returns false once the forwarder has shut down;
    /// the notification is then dropped.
    pub fn notify(&self) -> bool {
        self.tx.send(Event::SizeChanged).is_ok()
    }
}

/// Receiving half of the resize event stream, consumed by [`ResizeForwarder::spawn`]
pub struct ResizeEvents {
    rx: Receiver<Event>,
    tx: Sender<Event>,
}

#[cfg(test)]
impl ResizeEvents {
    /// Wait for the next size-change notification.
    pub(crate) fn next_timeout(&self, timeout: std::time::Duration) -> bool {
        matches!(self.rx.recv_timeout(timeout), Ok(Event::SizeChanged))
    }
}

/// Create a resize event stream
pub fn channel() -> (ResizeNotifier, ResizeEvents) {
    let (tx, rx) = mpsc::channel();
    (ResizeNotifier { tx: tx.clone() }, ResizeEvents { rx, tx })
}

/// Worker thread applying size changes to a [`ResizeTarget`]
pub struct ResizeForwarder {
    cancelled: Arc<AtomicBool>,
    wake: Sender<Event>,
    worker: Option<JoinHandle<usize>>,
}

impl ResizeForwarder {
    /// Start consuming `events`.
    pub fn spawn<T: ResizeTarget>(events: ResizeEvents, mut target: T) -> io::Result<Self> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let ResizeEvents { rx, tx } = events;

        let flag = Arc::clone(&cancelled);
        let worker = thread::Builder::new()
            .name("slowterm-resize".to_string())
            .spawn(move || {
                let mut applied = 0;
                for event in rx.iter() {
                    match event {
                        Event::Shutdown => break,
                        Event::SizeChanged if flag.load(Ordering::Acquire) => {
                            tracing::trace!("discarding resize notification after cancellation");
                        },
                        Event::SizeChanged => match target.sync_size() {
                            Ok(size) => {
                                applied += 1;
                                tracing::debug!("pty resized to {}", size);
                            },
                            // Serial consoles report 0x0 on every change
                            Err(ResizeError::EmptyWindow(size)) => {
                                tracing::debug!("keeping pty size, terminal reports {}", size);
                            },
                            Err(e) => tracing::warn!("error resizing pty: {}", e),
                        },
                    }
                }
                applied
            })?;

        Ok(Self {
            cancelled,
            wake: tx,
            worker: Some(worker),
        })
    }

    /// Stop the worker and wait for it. Returns how many resizes were
    /// applied over the forwarder's lifetime.
    pub fn cancel(mut self) -> usize {
        self.shutdown()
    }

    fn shutdown(&mut self) -> usize {
        let Some(worker) = self.worker.take() else {
            return 0;
        };
        self.cancelled.store(true, Ordering::Release);
        // Fails only if the worker is already gone
        let _ = self.wake.send(Event::Shutdown);
        match worker.join() {
            Ok(applied) => applied,
            Err(_) => {
                tracing::warn!("resize worker panicked");
                0
            },
        }
    }
}

impl Drop for ResizeForwarder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use nix::pty::openpty;

    /// Target that counts calls and can be made slow.
    struct Recorder {
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl ResizeTarget for Recorder {
        fn sync_size(&mut self) -> Result<WindowSize, ResizeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            Ok(WindowSize::default())
        }
    }

    struct Failing;

    impl ResizeTarget for Failing {
        fn sync_size(&mut self) -> Result<WindowSize, ResizeError> {
            Err(ResizeError::EmptyWindow(WindowSize::new(0, 0)))
        }
    }

    fn recorder(delay: Duration) -> (Recorder, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Recorder {
                calls: Arc::clone(&calls),
                delay,
            },
            calls,
        )
    }

    fn wait_for(calls: &AtomicUsize, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) < expected && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_each_notification_resizes() {
        let (notifier, events) = channel();
        let (target, calls) = recorder(Duration::ZERO);
        let forwarder = ResizeForwarder::spawn(events, target).unwrap();

        for _ in 0..3 {
            assert!(notifier.notify());
        }
        wait_for(&calls, 3);
        assert_eq!(forwarder.cancel(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failures_do_not_stop_forwarder() {
        let (notifier, events) = channel();
        let forwarder = ResizeForwarder::spawn(events, Failing).unwrap();
        assert!(notifier.notify());
        assert!(notifier.notify());
        assert_eq!(forwarder.cancel(), 0);
    }

    #[test]
    fn test_late_notifications_are_discarded() {
        let (notifier, events) = channel();
        let (target, calls) = recorder(Duration::from_millis(100));
        let forwarder = ResizeForwarder::spawn(events, target).unwrap();

        // One resize in flight while cancellation begins
        assert!(notifier.notify());
        wait_for(&calls, 1);

        let storm = {
            let notifier = notifier.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    notifier.notify();
                }
            })
        };

        let started = Instant::now();
        assert_eq!(forwarder.cancel(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        storm.join().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The worker is gone; sending is harmless
        assert!(!notifier.notify());
    }

    #[test]
    fn test_drop_stops_worker() {
        let (notifier, events) = channel();
        let (target, _calls) = recorder(Duration::ZERO);
        drop(ResizeForwarder::spawn(events, target).unwrap());
        assert!(!notifier.notify());
    }

    #[test]
    fn test_size_mirror_copies_dimensions() {
        let source = openpty(None, None).unwrap();
        let dest = openpty(None, None).unwrap();
        set_window_size(source.master.as_raw_fd(), WindowSize::new(132, 43)).unwrap();

        let mut mirror = SizeMirror::new(
            source.slave.try_clone().unwrap(),
            dest.master.try_clone().unwrap(),
        );
        assert_eq!(mirror.sync_size().unwrap(), WindowSize::new(132, 43));
        assert_eq!(
            get_window_size(dest.slave.as_raw_fd()).unwrap(),
            WindowSize::new(132, 43)
        );
    }

    #[test]
    fn test_size_mirror_keeps_size_for_empty_window() {
        let source = openpty(None, None).unwrap();
        let dest = openpty(None, None).unwrap();
        set_window_size(source.master.as_raw_fd(), WindowSize::new(0, 0)).unwrap();
        set_window_size(dest.master.as_raw_fd(), WindowSize::new(80, 24)).unwrap();

        let mut mirror = SizeMirror::new(
            source.slave.try_clone().unwrap(),
            dest.master.try_clone().unwrap(),
        );
        assert!(matches!(
            mirror.sync_size(),
            Err(ResizeError::EmptyWindow(size)) if size.is_empty()
        ));
        assert_eq!(
            get_window_size(dest.slave.as_raw_fd()).unwrap(),
            WindowSize::new(80, 24)
        );
    }

    #[test]
    fn test_size_mirror_rejects_non_terminal() {
        let dest = openpty(None, None).unwrap();
        let file = tempfile::tempfile().unwrap();
        let mut mirror = SizeMirror::new(OwnedFd::from(file), dest.master.try_clone().unwrap());
        assert!(matches!(mirror.sync_size(), Err(ResizeError::Query(_))));
    }
}
