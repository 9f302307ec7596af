/// Forked marking workers
///
/// Each worker is a fresh `fork()` of the coordinator that marks exactly one
/// submission and exits, so anything a test run leaks dies with it. The
/// worker reports back as one JSON line on a close-on-exec pipe; a worker
/// that dies without reporting is a crash.
use crate::config::config::MarkingOptions;
use crate::config::types::{MarksError, Result};
use crate::kernel::{process_group, signal};
use crate::marking::result::ResultRecord;
use crate::marking::runnable::TestRunnable;
use crate::marking::worker::{mark_one, MarkOutcome, MarkingHooks, Submission};
use log::{debug, error, warn};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, pipe2, ForkResult, Pid};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

/// What one worker reports for its submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum WorkerReport {
    Marked { record: ResultRecord, executed: bool },
    Interrupted { submission: String },
    Crashed { submission: String, message: String },
}

impl WorkerReport {
    pub fn submission(&self) -> &str {
        match self {
            WorkerReport::Marked { record, .. } => &record.submission,
            WorkerReport::Interrupted { submission } => submission,
            WorkerReport::Crashed { submission, .. } => submission,
        }
    }
}

/// A running worker process
struct Worker {
    pid: Pid,
    submission: Submission,
    status_pipe: File,
    buffer: Vec<u8>,
}

impl Worker {
    /// Read whatever the worker has written so far
    fn pump(&mut self) {
        let mut chunk = [0u8; 8192];
        loop {
            match self.status_pipe.read(&mut chunk) {
                Ok(0) => return,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("Status pipe of worker {} failed: {}", self.pid, e);
                    return;
                }
            }
        }
    }

    fn parsed_report(&self) -> Option<WorkerReport> {
        let line = self.buffer.split(|b| *b == b'\n').next()?;
        serde_json::from_slice(line).ok()
    }

    /// Final report once the worker has been reaped
    fn conclude(mut self, status: WaitStatus, interrupted: bool) -> WorkerReport {
        self.pump();
        if let Some(report) = self.parsed_report() {
            return report;
        }
        if interrupted {
            return WorkerReport::Interrupted {
                submission: self.submission.id,
            };
        }
        let message = format!("worker exited without a report ({:?})", status);
        error!("Marking submission {} crashed: {}", self.submission.id, message);
        WorkerReport::Crashed {
            submission: self.submission.id,
            message,
        }
    }
}

/// Fixed-size pool of single-use worker processes
pub struct WorkerPool<'a> {
    size: usize,
    kill_grace: Duration,
    runnable: &'a dyn TestRunnable,
    options: &'a MarkingOptions,
    hooks: &'a MarkingHooks,
}

impl<'a> WorkerPool<'a> {
    pub fn new(
        runnable: &'a dyn TestRunnable,
        options: &'a MarkingOptions,
        hooks: &'a MarkingHooks,
    ) -> Self {
        Self {
            size: options.processes.max(1),
            kill_grace: options.process.kill_grace,
            runnable,
            options,
            hooks,
        }
    }

    /// Mark every submission, calling `on_report` as each worker finishes.
    ///
    /// Returns true if the run was interrupted by the operator.
    pub fn run<F>(&self, submissions: Vec<Submission>, mut on_report: F) -> bool
    where
        F: FnMut(WorkerReport),
    {
        let mut pending: VecDeque<Submission> = submissions.into();
        let mut active: Vec<Worker> = Vec::new();
        let mut interrupted = false;

        loop {
            if !interrupted && !signal::should_continue() {
                warn!(
                    "Interrupted: stopping dispatch, {} submissions not started",
                    pending.len()
                );
                interrupted = true;
                pending.clear();
                self.terminate(&mut active, &mut on_report);
            }

            while !interrupted && active.len() < self.size {
                let Some(submission) = pending.pop_front() else {
                    break;
                };
                match self.spawn_worker(&submission) {
                    Ok(worker) => active.push(worker),
                    Err(e) => {
                        error!("Failed to start worker for {}: {}", submission.id, e);
                        on_report(WorkerReport::Crashed {
                            submission: submission.id,
                            message: e.to_string(),
                        });
                    }
                }
            }

            if active.is_empty() && pending.is_empty() {
                break;
            }

            let mut index = 0;
            while index < active.len() {
                active[index].pump();
                match waitpid(active[index].pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => index += 1,
                    Ok(status) => {
                        let worker = active.swap_remove(index);
                        on_report(worker.conclude(status, interrupted));
                    }
                    Err(e) => {
                        let worker = active.swap_remove(index);
                        warn!("waitpid on worker {} failed: {}", worker.pid, e);
                        on_report(worker.conclude(WaitStatus::StillAlive, interrupted));
                    }
                }
            }

            thread::sleep(POLL_INTERVAL);
        }

        interrupted
    }

    /// SIGTERM every worker, then SIGKILL whatever outlives the grace period
    fn terminate<F>(&self, active: &mut Vec<Worker>, on_report: &mut F)
    where
        F: FnMut(WorkerReport),
    {
        for worker in active.iter() {
            let _ = process_group::signal_process(worker.pid.as_raw(), Signal::SIGTERM);
        }

        let deadline = Instant::now() + self.kill_grace;
        while !active.is_empty() && Instant::now() < deadline {
            let mut index = 0;
            while index < active.len() {
                active[index].pump();
                match waitpid(active[index].pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => index += 1,
                    Ok(status) => {
                        let worker = active.swap_remove(index);
                        on_report(worker.conclude(status, true));
                    }
                    Err(_) => {
                        let worker = active.swap_remove(index);
                        on_report(worker.conclude(WaitStatus::StillAlive, true));
                    }
                }
            }
            thread::sleep(POLL_INTERVAL);
        }

        for worker in active.drain(..) {
            warn!("Worker {} ignored SIGTERM, killing it", worker.pid);
            let _ = process_group::signal_process(worker.pid.as_raw(), Signal::SIGKILL);
            let status = loop {
                match waitpid(worker.pid, None) {
                    Err(nix::errno::Errno::EINTR) => continue,
                    Ok(status) => break status,
                    Err(_) => break WaitStatus::StillAlive,
                }
            };
            on_report(worker.conclude(status, true));
        }
    }

    fn spawn_worker(&self, submission: &Submission) -> Result<Worker> {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| MarksError::Worker(format!("pipe: {}", e)))?;

        // SAFETY: the child only runs marking code and leaves through _exit.
        match unsafe { fork() }.map_err(|e| MarksError::Worker(format!("fork: {}", e)))? {
            ForkResult::Child => {
                drop(read_end);
                let code = self.worker_main(submission, write_end);
                // SAFETY: skips destructors and atexit handlers inherited from
                // the coordinator.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                drop(write_end);
                fcntl(read_end.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
                    .map_err(|e| MarksError::Worker(format!("fcntl: {}", e)))?;
                debug!("Worker {} marks {}", child, submission.id);
                Ok(Worker {
                    pid: child,
                    submission: submission.clone(),
                    status_pipe: File::from(read_end),
                    buffer: Vec::new(),
                })
            }
        }
    }

    fn worker_main(&self, submission: &Submission, status_pipe: OwnedFd) -> i32 {
        spawn_interrupt_watcher();

        let marked = panic::catch_unwind(AssertUnwindSafe(|| {
            mark_one(submission, self.runnable, self.options, self.hooks)
        }));

        let report = match marked {
            Ok(Ok(MarkOutcome::Marked { record, executed })) => {
                WorkerReport::Marked { record, executed }
            }
            Ok(Ok(MarkOutcome::Interrupted)) => WorkerReport::Interrupted {
                submission: submission.id.clone(),
            },
            Ok(Err(e)) => {
                error!("Marking submission {} failed: {}", submission.id, e);
                WorkerReport::Crashed {
                    submission: submission.id.clone(),
                    message: e.to_string(),
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Marking submission {} panicked: {}", submission.id, message);
                WorkerReport::Crashed {
                    submission: submission.id.clone(),
                    message,
                }
            }
        };

        let mut pipe = File::from(status_pipe);
        let written = serde_json::to_vec(&report)
            .map_err(MarksError::from)
            .and_then(|mut line| {
                line.push(b'\n');
                pipe.write_all(&line).map_err(MarksError::from)
            });
        match written {
            Ok(()) => 0,
            Err(e) => {
                error!("Worker for {} could not report: {}", submission.id, e);
                1
            }
        }
    }
}

/// Inside a worker: on interrupt, keep killing every group this worker
/// created until the worker exits.
fn spawn_interrupt_watcher() {
    let spawned = thread::Builder::new()
        .name("interrupt-watcher".to_string())
        .spawn(|| loop {
            if !signal::should_continue() {
                let killed = process_group::kill_registered_groups();
                if killed > 0 {
                    debug!("Killed {} process groups after interrupt", killed);
                }
            }
            thread::sleep(INTERRUPT_POLL);
        });
    if let Err(e) = spawned {
        warn!("No interrupt watcher in worker: {}", e);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_wire_format() {
        let report = WorkerReport::Interrupted {
            submission: "s1".to_string(),
        };
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(json, r#"{"report":"interrupted","submission":"s1"}"#);
        let back: WorkerReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.submission(), "s1");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
