//! Integration tests for the process controller
//!
//! These tests spawn real children and check termination classification,
//! timeouts and group-wide signalling.

use nix::sys::signal::Signal;
use rustmarks::config::config::ProcessConfig;
use rustmarks::kernel::process_group;
use rustmarks::process::{ProcessFactory, ProcessHandle, ProcessSpec};
use rustmarks::{StreamKind, Termination};
use std::time::{Duration, Instant};

fn spec(argv: &[&str]) -> ProcessSpec {
    ProcessSpec::new(argv.iter().map(|s| s.to_string()).collect())
}

fn wait_for_group_gone(pgid: i32, limit: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if !process_group::group_alive(pgid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    !process_group::group_alive(pgid)
}

#[test]
fn test_echo_happy_path() {
    let factory = ProcessFactory::default();
    let mut handle = factory
        .spawn(&spec(&["echo", "hello"]).timeout_secs(5).unwrap())
        .unwrap();

    assert_eq!(handle.readline(StreamKind::Stdout), "hello\n");
    assert_eq!(handle.readline(StreamKind::Stdout), "");
    assert!(handle.assert_exit_status(0));
    assert!(!handle.timed_out());
    assert!(!handle.check_signalled());
}

#[test]
fn test_timeout_kills_group() {
    let factory = ProcessFactory::default();
    let mut handle = factory
        .spawn(
            &spec(&["sh", "-c", "sleep 100 & while :; do sleep 1; done"])
                .timeout_secs(2)
                .unwrap(),
        )
        .unwrap();
    let pgid = handle.pid();
    let start = Instant::now();

    // Blocks until the deadline, then reports nothing
    assert_eq!(handle.readline(StreamKind::Stdout), "");
    let termination = handle.wait();
    let elapsed = start.elapsed();

    assert!(handle.timed_out());
    assert!(matches!(termination, Some(Termination::TimedOut { .. })));
    assert!(elapsed >= Duration::from_millis(1900), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(6), "elapsed {:?}", elapsed);
    assert_eq!(handle.exit_status(), None);
    assert_eq!(handle.signal(), None);
    assert!(!handle.check_signalled());
    assert!(wait_for_group_gone(pgid, Duration::from_secs(3)));

    // Reads after a timeout return immediately
    assert_eq!(handle.readline(StreamKind::Stderr), "");
}

#[test]
fn test_sigterm_to_group() {
    let factory = ProcessFactory::default();
    let handle = factory
        .spawn(&spec(&["sleep", "30"]).timeout_secs(10).unwrap())
        .unwrap();

    handle.send_signal_group(Signal::SIGTERM).unwrap();
    assert!(handle.assert_signalled(true));
    assert!(handle.assert_signal(Signal::SIGTERM));
    assert_eq!(handle.signal(), Some(libc::SIGTERM));
    assert!(!handle.timed_out());
}

#[test]
fn test_double_kill_keeps_state() {
    let factory = ProcessFactory::default();
    let handle = factory.spawn(&spec(&["sleep", "30"])).unwrap();

    handle.kill();
    let first = handle.termination();
    assert_eq!(first, Some(Termination::Signalled { signal: libc::SIGKILL }));

    handle.kill();
    assert_eq!(handle.termination(), first);
}

#[test]
fn test_kill_after_exit_is_noop() {
    let factory = ProcessFactory::default();
    let handle = factory.spawn(&spec(&["true"])).unwrap();
    assert!(handle.assert_exit_status(0));
    handle.kill();
    assert_eq!(handle.termination(), Some(Termination::Exited { code: 0 }));
}

#[test]
fn test_expect_file_is_reflexive() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("captured.txt");
    let argv = ["sh", "-c", "printf 'line one\\nline two\\npartial'"];

    let factory = ProcessFactory::default();
    let mut first = factory.spawn(&spec(&argv)).unwrap();
    first.capture_to_file(StreamKind::Stdout, &capture).unwrap();

    let mut second = factory.spawn(&spec(&argv)).unwrap();
    assert!(second.expect_file(StreamKind::Stdout, &capture));
}

#[test]
fn test_readline_without_timeout_waits_for_data() {
    let factory = ProcessFactory::default();
    let mut handle = factory
        .spawn(&spec(&["sh", "-c", "sleep 1; echo late"]))
        .unwrap();

    assert_eq!(handle.deadline(), None);
    assert_eq!(handle.readline(StreamKind::Stdout), "late\n");
    assert!(!handle.timed_out());
    assert!(handle.assert_exit_status(0));
}

#[test]
fn test_send_file_to_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.txt");
    std::fs::write(&input, "a\nb\n").unwrap();

    let mut handle = ProcessHandle::spawn(&spec(&["cat"]), &ProcessConfig::default()).unwrap();
    handle.send_file(&input).unwrap();
    handle.finish_input();
    assert!(handle.expect(StreamKind::Stdout, "a\nb\n"));
    assert!(handle.assert_exit_status(0));
}

#[test]
fn test_default_timeout_from_factory() {
    let factory = ProcessFactory::new(ProcessConfig {
        default_timeout: Some(Duration::from_secs(1)),
        ..ProcessConfig::default()
    });
    let handle = factory.spawn(&spec(&["sleep", "30"])).unwrap();
    assert!(handle.deadline().is_some());
    handle.wait();
    assert!(handle.timed_out());
}

#[test]
fn test_drop_kills_running_group() {
    let factory = ProcessFactory::default();
    let handle = factory.spawn(&spec(&["sleep", "30"])).unwrap();
    let pgid = handle.pid();
    assert!(process_group::registered_groups().contains(&pgid));

    drop(handle);
    assert!(!process_group::registered_groups().contains(&pgid));
    assert!(wait_for_group_gone(pgid, Duration::from_secs(3)));
}
