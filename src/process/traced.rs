/// TracedProcessHandle: a ProcessHandle whose descendants are observed
/// through ptrace fork events as they happen.
use crate::config::config::ProcessConfig;
use crate::config::types::{MarksError, Result};
use crate::kernel::process_group;
use crate::kernel::ptrace::{self, TraceControl, TraceEvent};
use crate::process::factory::ProcessSpec;
use crate::process::handle::{build_command, spawn_error, ChildPipes, ProcessHandle, RawExit, Shared};
use crossbeam_channel::bounded;
use log::{error, warn};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::os::unix::process::CommandExt;
use std::sync::Arc;
use std::thread;

pub struct TracedProcessHandle {
    inner: ProcessHandle,
}

impl TracedProcessHandle {
    /// Spawn under ptrace. The child is spawned by a dedicated tracer thread,
    /// which then stays in the trace loop until the whole subtree is gone.
    pub fn spawn(spec: &ProcessSpec, config: &ProcessConfig) -> Result<Self> {
        spec.validate()?;

        let (tx, rx) = bounded(1);
        let tracer_spec = spec.clone();
        let tracer_config = config.clone();
        thread::Builder::new()
            .name("tracer".to_string())
            .spawn(move || {
                let mut cmd = build_command(&tracer_spec, &tracer_config);
                // SAFETY: PTRACE_TRACEME is async-signal-safe and touches no
                // allocator state.
                unsafe {
                    cmd.pre_exec(ptrace::request_trace);
                }
                let mut child = match cmd.spawn() {
                    Ok(child) => child,
                    Err(e) => {
                        let _ = tx.send(Err(spawn_error(&tracer_spec, e)));
                        return;
                    }
                };

                let pid = child.id() as i32;
                let shared = Arc::new(Shared::new(pid));
                let pipes = ChildPipes {
                    stdin: child.stdin.take(),
                    stdout: child.stdout.take(),
                    stderr: child.stderr.take(),
                };
                if tx.send(Ok((Arc::clone(&shared), pipes))).is_err() {
                    process_group::kill_tree(pid, &BTreeSet::new());
                }

                run_tracer(&shared, tracer_config.descendant_limit);
            })
            .map_err(MarksError::Io)?;

        let (shared, pipes) = rx
            .recv()
            .map_err(|_| MarksError::Trace("tracer thread exited before spawning".to_string()))??;

        Ok(Self {
            inner: ProcessHandle::from_parts(spec, config, shared, pipes, true),
        })
    }

    /// Every process forked by the traced subtree so far
    pub fn descendant_pids(&self) -> BTreeSet<i32> {
        self.inner.shared().lock().descendants.clone()
    }

    /// Threads created by traced processes; not counted as descendants
    pub fn thread_ids(&self) -> BTreeSet<i32> {
        self.inner.shared().lock().threads.clone()
    }

    pub fn into_handle(self) -> ProcessHandle {
        self.inner
    }
}

impl Deref for TracedProcessHandle {
    type Target = ProcessHandle;

    fn deref(&self) -> &ProcessHandle {
        &self.inner
    }
}

impl DerefMut for TracedProcessHandle {
    fn deref_mut(&mut self) -> &mut ProcessHandle {
        &mut self.inner
    }
}

fn raw_exit(status: WaitStatus) -> Option<RawExit> {
    match status {
        WaitStatus::Exited(_, code) => Some(RawExit::Code(code)),
        WaitStatus::Signaled(_, sig, _) => Some(RawExit::Signal(sig as i32)),
        _ => None,
    }
}

fn run_tracer(shared: &Shared, limit: Option<usize>) {
    let root = shared.pid();
    let traced = ptrace::trace_tree(Pid::from_raw(root), |event| match event {
        TraceEvent::Spawned { pid, thread, .. } => {
            let mut state = shared.lock();
            state.live_tasks.insert(pid);
            if thread {
                state.threads.insert(pid);
                return TraceControl::Continue;
            }
            state.descendants.insert(pid);
            let live = state.live_tasks.difference(&state.threads).count();
            match limit {
                Some(limit) if live >= limit => {
                    warn!("Process {} reached {} live descendants, killing tree", root, live);
                    TraceControl::KillTree
                }
                _ => TraceControl::Continue,
            }
        }
        TraceEvent::Exited { pid, status } => {
            shared.lock().live_tasks.remove(&pid);
            if pid == root {
                if let Some(raw) = raw_exit(status) {
                    shared.record(raw);
                }
            }
            TraceControl::Continue
        }
    });

    if let Err(e) = traced {
        error!("Tracing {} failed: {}", root, e);
        shared.kill_tree();
        reap_untraced(shared);
    }
}

/// Fallback reap when the trace loop could not finish normally
fn reap_untraced(shared: &Shared) {
    if shared.termination().is_some() {
        return;
    }
    loop {
        match waitpid(Pid::from_raw(shared.pid()), None) {
            Ok(status) => {
                if let Some(raw) = raw_exit(status) {
                    shared.record(raw);
                    return;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("Cannot reap {}: {}", shared.pid(), e);
                shared.record(RawExit::Code(-1));
                return;
            }
        }
    }
}
