//! End-to-end session tests
//!
//! A second PTY pair plays the invoking terminal: the session gets its
//! slave side as stdin/stdout, and the tests drive and observe it through
//! the master side.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::unistd::pipe;
use nix::sys::termios::{self, LocalFlags};

use slowterm::app::CommandLine;
use slowterm::pty::ChildStatus;
use slowterm::relay::PumpEnd;
use slowterm::session::{self, SessionConfig, SessionError, Terminal};
use slowterm::term::ModeError;

/// Fast enough that pacing never dominates a test
const FAST: i64 = 1_000_000;

fn outer_terminal(cols: u16, rows: u16) -> OpenptyResult {
    let size = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    openpty(Some(&size), None).expect("Failed to open outer PTY")
}

fn terminal_for(outer: &OpenptyResult) -> Terminal {
    Terminal::from_fds(
        outer.slave.try_clone().unwrap(),
        outer.slave.try_clone().unwrap(),
    )
}

/// Collect everything the session writes to the outer terminal.
fn capture(master: &OwnedFd) -> Arc<Mutex<Vec<u8>>> {
    let output = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&output);
    let mut reader = File::from(master.try_clone().unwrap());
    thread::spawn(move || {
        let mut buf = [0u8; 1024];
        while let Ok(n) = reader.read(&mut buf) {
            if n == 0 {
                break;
            }
            sink.lock().unwrap().extend_from_slice(&buf[..n]);
        }
    });
    output
}

fn wait_for_output(output: &Mutex<Vec<u8>>, needle: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let text = String::from_utf8_lossy(&output.lock().unwrap()).into_owned();
        if text.contains(needle) || Instant::now() >= deadline {
            return text;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn command(program: &str, args: &[&str]) -> CommandLine {
    CommandLine::new(program, args.iter().map(|a| a.to_string()).collect())
}

fn local_flags<Fd: AsFd>(fd: Fd) -> LocalFlags {
    termios::tcgetattr(fd).unwrap().local_flags
}

#[test]
fn test_session_relays_output_and_restores_mode() {
    let outer = outer_terminal(80, 24);
    let before = local_flags(&outer.slave);
    let output = capture(&outer.master);

    let config = SessionConfig::new(command("/bin/echo", &["hello slowterm"]), FAST).unwrap();
    let report = session::run(&config, terminal_for(&outer)).expect("session failed");

    assert_eq!(report.status, ChildStatus::Exited(0));
    assert!(report.output.bytes >= "hello slowterm".len() as u64);
    let text = wait_for_output(&output, "hello slowterm");
    assert!(text.contains("hello slowterm"), "got: {text:?}");
    assert_eq!(local_flags(&outer.slave), before);
}

#[test]
fn test_session_propagates_exit_status() {
    let outer = outer_terminal(80, 24);
    let _output = capture(&outer.master);

    let config = SessionConfig::new(command("/bin/sh", &["-c", "exit 7"]), FAST).unwrap();
    let report = session::run(&config, terminal_for(&outer)).expect("session failed");
    assert_eq!(report.status, ChildStatus::Exited(7));
    assert_eq!(report.status.exit_code(), 7);
}

#[test]
fn test_session_output_is_throttled() {
    let outer = outer_terminal(80, 24);
    let _output = capture(&outer.master);

    // 20 bytes at 100 bytes per second
    let config = SessionConfig::new(command("printf", &["%s", "xxxxxxxxxxxxxxxxxxxx"]), 100)
        .unwrap();
    let started = Instant::now();
    let report = session::run(&config, terminal_for(&outer)).expect("session failed");
    let elapsed = started.elapsed();

    assert_eq!(report.output.bytes, 20);
    assert!(
        elapsed >= Duration::from_millis(190),
        "20 bytes at 100 baud took only {elapsed:?}"
    );
}

#[test]
fn test_session_forwards_window_size() {
    let outer = outer_terminal(100, 30);
    let output = capture(&outer.master);

    let config = SessionConfig::new(command("/bin/sh", &["-c", "stty size"]), FAST).unwrap();
    let report = session::run(&config, terminal_for(&outer)).expect("session failed");
    assert!(report.status.success());

    let text = wait_for_output(&output, "30 100");
    assert!(text.contains("30 100"), "got: {text:?}");
}

#[test]
fn test_session_relays_input() {
    let outer = outer_terminal(80, 24);
    let output = capture(&outer.master);
    let mut keyboard = File::from(outer.master.try_clone().unwrap());

    let config = SessionConfig::new(command("/bin/sh", &["-c", "head -c 5"]), FAST).unwrap();
    let terminal = terminal_for(&outer);
    let session = thread::spawn(move || session::run(&config, terminal));

    thread::sleep(Duration::from_millis(200));
    keyboard.write_all(b"abcd\r").unwrap();

    let report = session
        .join()
        .expect("session panicked")
        .expect("session failed");
    assert_eq!(report.status, ChildStatus::Exited(0));
    let text = wait_for_output(&output, "abcd");
    assert!(text.contains("abcd"), "got: {text:?}");
}

#[test]
fn test_session_rejects_non_terminal_input() {
    let input = tempfile::tempfile().unwrap();
    let mut output = tempfile::tempfile().unwrap();
    let terminal = Terminal::from_fds(
        OwnedFd::from(input),
        OwnedFd::from(output.try_clone().unwrap()),
    );

    let config = SessionConfig::new(command("sleep", &["30"]), FAST).unwrap();
    let started = Instant::now();
    let err = session::run(&config, terminal).unwrap_err();
    assert!(matches!(err, SessionError::Mode(ModeError::NotATerminal)));
    assert!(started.elapsed() < Duration::from_secs(5));

    let mut relayed = Vec::new();
    output.read_to_end(&mut relayed).unwrap();
    assert!(relayed.is_empty());
}

#[test]
fn test_session_spawn_failure_leaves_terminal_alone() {
    let outer = outer_terminal(80, 24);
    let before = local_flags(&outer.slave);

    let config = SessionConfig::new(command("/nonexistent/slowterm-child", &[]), FAST).unwrap();
    let err = session::run(&config, terminal_for(&outer)).unwrap_err();
    assert!(matches!(err, SessionError::Spawn { .. }), "got: {err}");
    assert!(before.contains(LocalFlags::ICANON));
    assert_eq!(local_flags(&outer.slave), before);
}

#[test]
fn test_session_output_failure_ends_session() {
    let outer = outer_terminal(80, 24);
    let before = local_flags(&outer.slave);

    // Nobody reads the output, so the first relayed byte fails with EPIPE
    let (reader, writer) = pipe().unwrap();
    drop(reader);
    let terminal = Terminal::from_fds(outer.slave.try_clone().unwrap(), writer);

    let child = command("/bin/sh", &["-c", "echo hi; sleep 30"]);
    let config = SessionConfig::new(child, FAST).unwrap();
    let started = Instant::now();
    let report = session::run(&config, terminal).expect("session failed");

    match &report.output.end {
        PumpEnd::WriteFailed(e) => assert_eq!(e.kind(), ErrorKind::BrokenPipe),
        other => panic!("expected a write failure, got: {other}"),
    }
    assert_eq!(report.output.bytes, 0);
    // The child was still running and got hung up
    assert!(!report.status.success());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(local_flags(&outer.slave), before);
}
