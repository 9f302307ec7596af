/// ptrace-based descendant discovery
///
/// The traced child calls `PTRACE_TRACEME` before exec and stops with SIGTRAP
/// once the new image is loaded. The tracer then enables fork/vfork/clone
/// tracing so the kernel auto-attaches every new task and reports its pid
/// before the task runs a single instruction. Nothing forked by the subtree
/// can escape observation, unlike a scan of the process table.
///
/// ptrace requests are only honoured from the tracing thread, so the thread
/// that spawns the child must be the one that runs [`trace_tree`].
use crate::config::types::{MarksError, Result};
use crate::kernel::process_group;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Event, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeSet;

/// Events reported to the tracer's observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// A traced task created a new task. `thread` is true for clone events.
    Spawned { parent: i32, pid: i32, thread: bool },
    /// A traced task exited or was killed
    Exited { pid: i32, status: WaitStatus },
}

/// Observer decision after each event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceControl {
    Continue,
    /// SIGKILL the root process group and every live traced task
    KillTree,
}

/// Options set on the root tracee; inherited by every auto-attached task.
/// TRACEEXEC turns the legacy post-exec SIGTRAP into an event stop, so a
/// descendant's exec is never mistaken for a real SIGTRAP.
pub fn trace_options() -> Options {
    Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEEXEC
        | Options::PTRACE_O_EXITKILL
}

/// Called in the child between fork and exec
pub fn request_trace() -> std::io::Result<()> {
    ptrace::traceme().map_err(std::io::Error::from)
}

fn is_job_control_stop(sig: Signal) -> bool {
    matches!(
        sig,
        Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
    )
}

fn resume(pid: Pid, sig: Option<Signal>) {
    if let Err(e) = ptrace::cont(pid, sig) {
        // ESRCH: the task was killed while stopped
        if e != Errno::ESRCH {
            warn!("PTRACE_CONT {} failed: {}", pid, e);
        }
    }
}

fn wait_initial_stop(root: Pid) -> Result<Option<WaitStatus>> {
    loop {
        match waitpid(root, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => return Ok(None),
            Ok(status @ WaitStatus::Exited(..)) | Ok(status @ WaitStatus::Signaled(..)) => {
                return Ok(Some(status))
            }
            Ok(other) => {
                debug!("Unexpected initial stop for {}: {:?}", root, other);
                resume(root, None);
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(MarksError::Trace(format!("waitpid(initial {}): {}", root, e))),
        }
    }
}

/// Trace `root` and all of its descendants until every traced task is gone.
///
/// Must run on the thread that spawned `root`.
pub fn trace_tree<F>(root: Pid, mut on_event: F) -> Result<()>
where
    F: FnMut(TraceEvent) -> TraceControl,
{
    if let Some(status) = wait_initial_stop(root)? {
        on_event(TraceEvent::Exited {
            pid: root.as_raw(),
            status,
        });
        return Ok(());
    }

    ptrace::setoptions(root, trace_options())
        .map_err(|e| MarksError::Trace(format!("PTRACE_SETOPTIONS {}: {}", root, e)))?;
    resume(root, None);

    let mut live: BTreeSet<i32> = BTreeSet::from([root.as_raw()]);
    // New tasks announced by an event whose initial SIGSTOP is still pending
    let mut awaiting_stop: BTreeSet<i32> = BTreeSet::new();
    // New tasks whose initial SIGSTOP arrived before the parent's event
    let mut stopped_early: BTreeSet<i32> = BTreeSet::new();
    let mut root_done = false;

    while !(root_done && live.is_empty()) {
        let status = match waitpid(
            Pid::from_raw(-1),
            Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD),
        ) {
            Ok(status) => status,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                process_group::kill_tree(root.as_raw(), &live);
                return Err(MarksError::Trace(format!("waitpid(trace {}): {}", root, e)));
            }
        };

        let control = match status {
            WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                let raw = pid.as_raw();
                live.remove(&raw);
                awaiting_stop.remove(&raw);
                stopped_early.remove(&raw);
                if pid == root {
                    root_done = true;
                }
                on_event(TraceEvent::Exited { pid: raw, status })
            }
            WaitStatus::PtraceEvent(pid, _, event)
                if event == Event::PTRACE_EVENT_FORK as i32
                    || event == Event::PTRACE_EVENT_VFORK as i32
                    || event == Event::PTRACE_EVENT_CLONE as i32 =>
            {
                let control = match ptrace::getevent(pid) {
                    Ok(msg) => {
                        let child = msg as i32;
                        live.insert(child);
                        if !stopped_early.remove(&child) {
                            awaiting_stop.insert(child);
                        }
                        debug!("Traced task {} created {}", pid, child);
                        on_event(TraceEvent::Spawned {
                            parent: pid.as_raw(),
                            pid: child,
                            thread: event == Event::PTRACE_EVENT_CLONE as i32,
                        })
                    }
                    Err(e) => {
                        warn!("PTRACE_GETEVENTMSG {} failed: {}", pid, e);
                        TraceControl::Continue
                    }
                };
                resume(pid, None);
                control
            }
            WaitStatus::PtraceEvent(pid, _, _) | WaitStatus::PtraceSyscall(pid) => {
                resume(pid, None);
                TraceControl::Continue
            }
            WaitStatus::Stopped(pid, sig) => {
                let raw = pid.as_raw();
                if sig == Signal::SIGSTOP && awaiting_stop.remove(&raw) {
                    resume(pid, None);
                } else if !live.contains(&raw) {
                    live.insert(raw);
                    stopped_early.insert(raw);
                    resume(pid, None);
                } else if is_job_control_stop(sig) {
                    // Submissions are never allowed to park themselves
                    resume(pid, None);
                } else {
                    resume(pid, Some(sig));
                }
                TraceControl::Continue
            }
            WaitStatus::Continued(_) | WaitStatus::StillAlive => TraceControl::Continue,
        };

        if control == TraceControl::KillTree {
            let report = process_group::kill_tree(root.as_raw(), &live);
            debug!("Killed traced tree of {}: {:?}", root, report);
        }
    }

    // Anything still known at this point escaped the root's exit
    if !live.is_empty() {
        process_group::kill_tree(root.as_raw(), &live);
    }

    Ok(())
}
