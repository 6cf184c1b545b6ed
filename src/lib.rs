//! slowterm library
//!
//! Runs a child process on a pseudoterminal and relays bytes between the
//! invoking terminal and the child at an emulated baudrate, one byte at a
//! time, the way a slow serial line would.
//!
//! - `pty`: PTY allocation and child process management
//! - `term`: raw mode for the invoking terminal
//! - `relay`: rate-limited byte pumps
//! - `resize`: window size forwarding
//! - `signals`: SIGWINCH subscription
//! - `session`: the whole thing wired together
//! - `app`: configuration and logging for the binary

pub mod app;
pub mod pty;
pub mod relay;
pub mod resize;
pub mod session;
pub mod signals;
pub mod term;
