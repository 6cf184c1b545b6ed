//! Rate-limited byte relay
//!
//! A pump copies exactly one byte at a time from a source to a
//! destination and sleeps between bytes so that no more than one byte
//! leaves per interval. Time already spent on a transfer counts against
//! the interval: a slow source or destination is never penalized twice.

use std::fmt;
use std::io::{self, Read, Write};
use std::num::NonZeroU32;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Emulated line speed, in bytes per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Baudrate(NonZeroU32);

/// Error type for rate validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateError {
    #[error("baudrate must be positive, got {0}")]
    NotPositive(i64),

    #[error("baudrate {0} is too large (maximum 4294967295)")]
    TooLarge(i64),
}

impl Baudrate {
    /// 9600 baud, the classic terminal line speed
    pub const DEFAULT: Baudrate = match NonZeroU32::new(9600) {
        Some(rate) => Baudrate(rate),
        None => unreachable!(),
    };

    /// Validate a user-supplied rate
    pub fn new(rate: i64) -> Result<Self, RateError> {
        if rate <= 0 {
            return Err(RateError::NotPositive(rate));
        }
        let rate = u32::try_from(rate).map_err(|_| RateError::TooLarge(rate))?;
        // rate > 0 was checked above
        NonZeroU32::new(rate)
            .map(Baudrate)
            .ok_or(RateError::NotPositive(0))
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Time budget for a single byte. Never zero: rates above one byte
    /// per nanosecond are clamped to a 1ns interval.
    pub fn interval(self) -> Duration {
        (Duration::from_secs(1) / self.0.get()).max(Duration::from_nanos(1))
    }
}

impl Default for Baudrate {
    fn default() -> Self {
        Baudrate::DEFAULT
    }
}

impl fmt::Display for Baudrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} baud", self.0)
    }
}

/// Per-byte pacing policy shared by both pump directions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiter {
    interval: Duration,
}

impl RateLimiter {
    pub fn new(rate: Baudrate) -> Self {
        Self {
            interval: rate.interval(),
        }
    }

    /// Limiter with an explicit interval. A zero interval is raised to 1ns.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_nanos(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How long to sleep after a transfer that took `elapsed`, if at all.
    pub fn delay_after(&self, elapsed: Duration) -> Option<Duration> {
        let remaining = self.interval.saturating_sub(elapsed);
        if remaining.is_zero() {
            None
        } else {
            Some(remaining)
        }
    }
}

/// Why a pump stopped. None of these is an error for the session: they
/// all mean "this direction is done".
#[derive(Debug)]
pub enum PumpEnd {
    /// The source reported end-of-stream
    Eof,
    /// Reading the source failed (EIO on a hung-up PTY lands here)
    ReadFailed(io::Error),
    /// Writing or flushing the destination failed
    WriteFailed(io::Error),
}

impl fmt::Display for PumpEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpEnd::Eof => write!(f, "end of stream"),
            PumpEnd::ReadFailed(e) => write!(f, "read failed: {e}"),
            PumpEnd::WriteFailed(e) => write!(f, "write failed: {e}"),
        }
    }
}

/// Statistics for a finished pump
#[derive(Debug)]
pub struct PumpReport {
    /// Bytes delivered to the destination
    pub bytes: u64,
    /// Bytes that were followed by a pacing sleep
    pub paced: u64,
    /// Total time spent in pacing sleeps
    pub slept: Duration,
    pub end: PumpEnd,
}

/// Relay `src` into `dst` one byte at a time until the source ends or
/// either side fails.
pub fn pump<W, R>(dst: &mut W, src: &mut R, limiter: &RateLimiter) -> PumpReport
where
    W: Write + ?Sized,
    R: Read + ?Sized,
{
    let mut byte = [0u8; 1];
    let mut bytes = 0;
    let mut paced = 0;
    let mut slept = Duration::ZERO;

    let end = loop {
        let started = Instant::now();
        match src.read(&mut byte) {
            Ok(0) => break PumpEnd::Eof,
            Ok(_) => {},
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break PumpEnd::ReadFailed(e),
        }
        if let Err(e) = dst.write_all(&byte).and_then(|()| dst.flush()) {
            break PumpEnd::WriteFailed(e);
        }
        bytes += 1;

        if let Some(delay) = limiter.delay_after(started.elapsed()) {
            thread::sleep(delay);
            paced += 1;
            slept += delay;
        }
    };

    PumpReport {
        bytes,
        paced,
        slept,
        end,
    }
}

/// Run a pump on its own named thread.
pub fn spawn_pump<W, R>(
    name: &str,
    mut dst: W,
    mut src: R,
    limiter: RateLimiter,
) -> io::Result<JoinHandle<PumpReport>>
where
    W: Write + Send + 'static,
    R: Read + Send + 'static,
{
    let label = name.to_string();
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let report = pump(&mut dst, &mut src, &limiter);
        tracing::debug!(
            "{} pump stopped after {} bytes ({} paced): {}",
            label,
            report.bytes,
            report.paced,
            report.end
        );
        report
    })
}
