//! Integration tests for traced handles
//!
//! ptrace can be forbidden (seccomp, yama ptrace_scope=3); tests skip then.

use rustmarks::config::config::ProcessConfig;
use rustmarks::process::{ProcessSpec, TracedProcessHandle};
use rustmarks::{StreamKind, Termination};

fn spec(argv: &[&str]) -> ProcessSpec {
    ProcessSpec::new(argv.iter().map(|s| s.to_string()).collect())
}

fn spawn_traced(argv: &[&str], config: &ProcessConfig) -> Option<TracedProcessHandle> {
    // PTRACE_TRACEME failing in the child surfaces as a spawn error
    match TracedProcessHandle::spawn(&spec(argv).timeout_secs(10).unwrap(), config) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Skipping traced test, spawn failed: {}", e);
            None
        }
    }
}

#[test]
fn test_grandchild_is_observed() {
    let config = ProcessConfig::default();
    let Some(mut handle) = spawn_traced(&["sh", "-c", "sh -c 'echo $$'; true"], &config) else {
        return;
    };

    let line = handle.readline(StreamKind::Stdout);
    assert!(handle.assert_exit_status(0));

    let reported: i32 = line.trim().parse().unwrap();
    let descendants = handle.descendant_pids();
    assert!(
        descendants.contains(&reported),
        "{} not in {:?}",
        reported,
        descendants
    );
    assert!(!descendants.contains(&handle.pid()));
    // sh never creates threads, and threads are never listed as descendants
    assert!(handle.thread_ids().is_empty());
}

#[test]
fn test_traced_signal_classification() {
    let config = ProcessConfig::default();
    let Some(handle) = spawn_traced(&["sh", "-c", "kill -TERM $$"], &config) else {
        return;
    };
    assert!(handle.assert_signal(nix::sys::signal::Signal::SIGTERM));
    assert!(!handle.timed_out());
}

#[test]
fn test_descendant_limit_kills_tree() {
    let config = ProcessConfig {
        descendant_limit: Some(3),
        ..ProcessConfig::default()
    };
    let Some(handle) = spawn_traced(
        &["sh", "-c", "for i in 1 2 3 4 5 6; do sleep 30 & done; wait"],
        &config,
    ) else {
        return;
    };

    let termination = handle.wait();
    assert_eq!(termination, Some(Termination::Signalled { signal: libc::SIGKILL }));
    assert!(handle.descendant_pids().len() >= 3);
}
