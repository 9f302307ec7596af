/// ProcessHandle: one spawned child in its own process group
///
/// Terminal state lives in [`Shared`], written once by whichever thread reaps
/// the child (the plain reaper or the ptrace tracer) and read by the caller,
/// the watchdog and kill paths.
use crate::config::config::ProcessConfig;
use crate::config::types::{MarksError, Result, StreamKind, Termination};
use crate::kernel::process_group::{self, KillReport};
use crate::process::factory::ProcessSpec;
use crate::process::stream::{InputWriter, LineRead, LineReader};
use crate::process::watchdog;
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use std::collections::BTreeSet;
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Raw cause reported by the reaping thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawExit {
    Code(i32),
    Signal(i32),
}

impl From<ExitStatus> for RawExit {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => RawExit::Code(code),
            (None, Some(sig)) => RawExit::Signal(sig),
            // Stopped/continued are never reported by a blocking wait
            (None, None) => RawExit::Code(-1),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct State {
    pub termination: Option<Termination>,
    pub deadline_hit: bool,
    pub ended: Option<Instant>,
    /// Traced tasks currently alive, threads included
    pub live_tasks: BTreeSet<i32>,
    /// Every process forked by the traced subtree
    pub descendants: BTreeSet<i32>,
    pub threads: BTreeSet<i32>,
    /// Leader reaped and group seen empty; the id may since have been reused
    pub group_released: bool,
}

/// State shared between a handle and its helper threads
#[derive(Debug)]
pub(crate) struct Shared {
    pid: i32,
    started: Instant,
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            started: Instant::now(),
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the terminal cause. Later calls never change it.
    pub fn record(&self, raw: RawExit) {
        let mut state = self.lock();
        if state.termination.is_some() {
            return;
        }
        let termination = match (state.deadline_hit, raw) {
            (true, RawExit::Signal(sig)) => Termination::TimedOut { signal: Some(sig) },
            (true, RawExit::Code(_)) => Termination::TimedOut { signal: None },
            (false, RawExit::Code(code)) => Termination::Exited { code },
            (false, RawExit::Signal(sig)) => Termination::Signalled { signal: sig },
        };
        debug!("Process {} {}", self.pid, termination);
        state.termination = Some(termination);
        state.ended = Some(Instant::now());
        self.changed.notify_all();
    }

    pub fn termination(&self) -> Option<Termination> {
        self.lock().termination
    }

    /// Block until terminated or `deadline`; `None` deadline waits forever.
    pub fn wait_terminated(&self, deadline: Option<Instant>) -> Option<Termination> {
        let mut state = self.lock();
        loop {
            if let Some(termination) = state.termination {
                return Some(termination);
            }
            state = match deadline {
                None => self
                    .changed
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }

    /// Deadline reached: mark timed out (unless already terminated) and kill.
    pub fn expire(&self) {
        {
            let mut state = self.lock();
            if state.termination.is_some() || state.deadline_hit {
                return;
            }
            state.deadline_hit = true;
        }
        info!("Process {} timed out, killing its group", self.pid);
        self.kill_tree();
    }

    pub fn deadline_hit(&self) -> bool {
        let state = self.lock();
        state.deadline_hit || state.termination.is_some_and(|t| t.timed_out())
    }

    /// SIGKILL the process group and every live traced task.
    ///
    /// Once the leader is reaped and no member is left, the group id is never
    /// signalled again.
    pub fn kill_tree(&self) -> KillReport {
        let (released, tasks) = {
            let mut state = self.lock();
            if !state.group_released
                && state.termination.is_some()
                && !process_group::group_alive(self.pid)
            {
                debug!("Process group {} is empty, releasing it", self.pid);
                state.group_released = true;
                process_group::unregister_group(self.pid);
            }
            (state.group_released, state.live_tasks.clone())
        };
        if !released {
            return process_group::kill_tree(self.pid, &tasks);
        }

        let mut report = KillReport::default();
        for pid in tasks {
            match process_group::signal_process(pid, Signal::SIGKILL) {
                Ok(()) => report.tasks_killed += 1,
                Err(e) => report.notes.push(format!("SIGKILL {} failed: {}", pid, e)),
            }
        }
        report
    }

    pub fn group_released(&self) -> bool {
        self.lock().group_released
    }

    pub fn wall_time(&self) -> Duration {
        match self.lock().ended {
            Some(ended) => ended.duration_since(self.started),
            None => self.started.elapsed(),
        }
    }
}

pub(crate) fn build_command(spec: &ProcessSpec, config: &ProcessConfig) -> Command {
    let mut cmd = Command::new(&spec.argv[0]);
    cmd.args(&spec.argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(preload) = &config.ld_preload {
        cmd.env("LD_PRELOAD", preload);
    }
    cmd
}

pub(crate) fn spawn_error(spec: &ProcessSpec, err: std::io::Error) -> MarksError {
    MarksError::Spawn {
        program: spec.argv[0].clone(),
        reason: err.to_string(),
    }
}

/// Pipes taken from a freshly spawned child
pub(crate) struct ChildPipes {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// One spawned child process
pub struct ProcessHandle {
    argv: Vec<String>,
    shared: Arc<Shared>,
    stdin: InputWriter,
    stdout: LineReader,
    stderr: LineReader,
    deadline: Option<Instant>,
    kill_grace: Duration,
    traced: bool,
}

impl ProcessHandle {
    /// Spawn `spec.argv` as the leader of a new process group.
    pub fn spawn(spec: &ProcessSpec, config: &ProcessConfig) -> Result<Self> {
        spec.validate()?;
        let mut child = build_command(spec, config)
            .spawn()
            .map_err(|e| spawn_error(spec, e))?;

        let pid = child.id() as i32;
        let shared = Arc::new(Shared::new(pid));
        let pipes = ChildPipes {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };

        let reaper_state = Arc::clone(&shared);
        let reaper = thread::Builder::new()
            .name(format!("reaper-{}", pid))
            .spawn(move || loop {
                match child.wait() {
                    Ok(status) => {
                        reaper_state.record(RawExit::from(status));
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("wait() on {} failed: {}", reaper_state.pid(), e);
                        reaper_state.record(RawExit::Code(-1));
                        break;
                    }
                }
            });
        if let Err(e) = reaper {
            process_group::kill_tree(pid, &BTreeSet::new());
            return Err(MarksError::Io(e));
        }

        Ok(Self::from_parts(spec, config, shared, pipes, false))
    }

    pub(crate) fn from_parts(
        spec: &ProcessSpec,
        config: &ProcessConfig,
        shared: Arc<Shared>,
        pipes: ChildPipes,
        traced: bool,
    ) -> Self {
        let pid = shared.pid();
        process_group::register_group(pid);
        debug!("Spawned {:?} as {}", spec.argv, pid);

        let stdin = match pipes.stdin {
            Some(sink) => InputWriter::spawn(pid, sink, spec.stdin.clone()),
            None => InputWriter::closed(pid),
        };
        let stdout = match pipes.stdout {
            Some(out) => LineReader::spawn(out, format!("stdout-{}", pid)),
            None => LineReader::closed(),
        };
        let stderr = match pipes.stderr {
            Some(err) => LineReader::spawn(err, format!("stderr-{}", pid)),
            None => LineReader::closed(),
        };

        let deadline = spec
            .timeout
            .or(config.default_timeout)
            .map(|timeout| Instant::now() + timeout);
        if let Some(deadline) = deadline {
            watchdog::arm(Arc::clone(&shared), deadline);
        }

        Self {
            argv: spec.argv.clone(),
            shared,
            stdin,
            stdout,
            stderr,
            deadline,
            kill_grace: config.kill_grace,
            traced,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn pid(&self) -> i32 {
        self.shared.pid()
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn is_traced(&self) -> bool {
        self.traced
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Queue bytes for the child's stdin
    pub fn send(&self, bytes: impl AsRef<[u8]>) -> Result<()> {
        self.stdin.send(bytes.as_ref().to_vec())
    }

    /// Queue a file's full contents for the child's stdin
    pub fn send_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = std::fs::read(path.as_ref())?;
        self.stdin.send(contents)
    }

    /// Close the child's stdin after queued data is written. Idempotent.
    pub fn finish_input(&mut self) {
        self.stdin.finish();
    }

    fn reader(&mut self, stream: StreamKind) -> &mut LineReader {
        match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }

    /// Next line of `stream` including its newline; empty at end-of-file or
    /// once the handle has timed out.
    pub fn readline(&mut self, stream: StreamKind) -> String {
        if self.timed_out() {
            return String::new();
        }
        let deadline = self.deadline;
        match self.reader(stream).read_line(deadline) {
            LineRead::Line(line) => String::from_utf8_lossy(&line).into_owned(),
            LineRead::Eof => String::new(),
            LineRead::TimedOut => {
                self.shared.expire();
                String::new()
            }
        }
    }

    /// Everything left in `stream`, bounded by the handle deadline
    pub fn read_to_end(&mut self, stream: StreamKind) -> Vec<u8> {
        if self.timed_out() {
            return Vec::new();
        }
        let deadline = self.deadline;
        let (bytes, complete) = self.reader(stream).drain(deadline);
        if !complete {
            self.shared.expire();
        }
        bytes
    }

    /// Drain `stream` and compare it exactly with `text`
    pub fn expect(&mut self, stream: StreamKind, text: &str) -> bool {
        self.read_to_end(stream) == text.as_bytes()
    }

    /// Drain `stream` and compare it exactly with the contents of `path`
    pub fn expect_file(&mut self, stream: StreamKind, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let expected = match std::fs::read(path) {
            Ok(expected) => expected,
            Err(e) => {
                warn!("Cannot read expected output {}: {}", path.display(), e);
                return false;
            }
        };
        self.read_to_end(stream) == expected
    }

    /// Save the rest of `stream` to `path`
    pub fn capture_to_file(&mut self, stream: StreamKind, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.read_to_end(stream);
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Copy the rest of `stream` to this process's stdout
    pub fn dump(&mut self, stream: StreamKind) -> Result<()> {
        self.dump_to(stream, &mut std::io::stdout().lock())
    }

    /// Copy the rest of `stream` into `out`
    pub fn dump_to<W: Write>(&mut self, stream: StreamKind, out: &mut W) -> Result<()> {
        let bytes = self.read_to_end(stream);
        out.write_all(&bytes)?;
        out.flush()?;
        Ok(())
    }

    /// SIGKILL the whole group (and traced tasks), then wait a bounded grace
    /// period for the child to be reaped. Safe to call any number of times.
    pub fn kill(&self) {
        let report = self.shared.kill_tree();
        if !report.notes.is_empty() {
            debug!("Kill of {}: {:?}", self.pid(), report.notes);
        }
        self.shared
            .wait_terminated(Some(Instant::now() + self.kill_grace));
    }

    /// Deliver `sig` to the child alone
    pub fn send_signal(&self, sig: Signal) -> Result<()> {
        if self.shared.termination().is_some() {
            return Ok(());
        }
        process_group::signal_process(self.pid(), sig)
    }

    /// Deliver `sig` to the child's whole process group
    pub fn send_signal_group(&self, sig: Signal) -> Result<()> {
        process_group::signal_group(self.pid(), sig)
    }

    /// Wait for termination, bounded by the deadline when one is set.
    ///
    /// A deadline that passes while waiting times the process out; the kill
    /// is then given the grace period to be reaped.
    pub fn wait(&self) -> Option<Termination> {
        if let Some(termination) = self.shared.wait_terminated(self.deadline) {
            return Some(termination);
        }
        self.shared.expire();
        self.shared
            .wait_terminated(Some(Instant::now() + self.kill_grace))
    }

    /// Terminal state without waiting
    pub fn termination(&self) -> Option<Termination> {
        self.shared.termination()
    }

    pub fn finished(&self) -> bool {
        self.termination().is_some()
    }

    pub fn timed_out(&self) -> bool {
        self.shared.deadline_hit()
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.termination().and_then(|t| t.exit_status())
    }

    pub fn signal(&self) -> Option<i32> {
        self.termination().and_then(|t| t.signal())
    }

    pub fn assert_exit_status(&self, code: i32) -> bool {
        self.wait().and_then(|t| t.exit_status()) == Some(code)
    }

    /// True when the child was ended by a signal and that matches `expected`
    pub fn assert_signalled(&self, expected: bool) -> bool {
        self.check_signalled() == expected
    }

    pub fn assert_signal(&self, sig: Signal) -> bool {
        self.wait().and_then(|t| t.signal()) == Some(sig as i32)
    }

    pub fn check_signalled(&self) -> bool {
        self.wait().is_some_and(|t| t.signalled())
    }

    /// Time from spawn until the child was reaped (or until now)
    pub fn wall_time(&self) -> Duration {
        self.shared.wall_time()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.stdin.finish();
        // Also catches members that outlived a finished leader.
        self.shared.kill_tree();
        if self.shared.termination().is_none() {
            self.shared
                .wait_terminated(Some(Instant::now() + self.kill_grace));
        }
        process_group::unregister_group(self.pid());
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid())
            .field("argv", &self.argv)
            .field("traced", &self.traced)
            .field("termination", &self.termination())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::StdinSource;

    fn spec(argv: &[&str]) -> ProcessSpec {
        ProcessSpec::new(argv.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_record_is_write_once() {
        let shared = Shared::new(4_194_304 + 11);
        shared.record(RawExit::Code(0));
        shared.record(RawExit::Signal(9));
        assert_eq!(shared.termination(), Some(Termination::Exited { code: 0 }));
    }

    #[test]
    fn test_deadline_turns_kill_into_timeout() {
        let shared = Shared::new(4_194_304 + 13);
        shared.expire();
        assert!(shared.deadline_hit());
        shared.record(RawExit::Signal(9));
        assert_eq!(
            shared.termination(),
            Some(Termination::TimedOut { signal: Some(9) })
        );
    }

    #[test]
    fn test_expire_after_exit_is_ignored() {
        let shared = Shared::new(4_194_304 + 17);
        shared.record(RawExit::Code(2));
        shared.expire();
        assert!(!shared.deadline_hit());
        assert_eq!(shared.termination(), Some(Termination::Exited { code: 2 }));
    }

    #[test]
    fn test_wait_terminated_times_out() {
        let shared = Shared::new(4_194_304 + 19);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(shared.wait_terminated(Some(deadline)), None);
    }

    #[test]
    fn test_spawn_missing_program() {
        let err = ProcessHandle::spawn(
            &spec(&["/definitely/not/a/program"]),
            &ProcessConfig::default(),
        )
        .unwrap_err();
        assert!(err.is_spawn());
    }

    #[test]
    fn test_exit_code_recorded() {
        let handle = ProcessHandle::spawn(&spec(&["sh", "-c", "exit 3"]), &ProcessConfig::default())
            .unwrap();
        assert!(handle.assert_exit_status(3));
        assert!(!handle.check_signalled());
        assert!(!handle.timed_out());
        assert_eq!(handle.signal(), None);
    }

    #[test]
    fn test_send_and_finish_input() {
        let mut handle =
            ProcessHandle::spawn(&spec(&["cat"]), &ProcessConfig::default()).unwrap();
        handle.send("ping\n").unwrap();
        assert_eq!(handle.readline(StreamKind::Stdout), "ping\n");
        handle.finish_input();
        handle.finish_input();
        assert!(handle.send("late").is_err());
        assert_eq!(handle.readline(StreamKind::Stdout), "");
        assert!(handle.assert_exit_status(0));
    }

    #[test]
    fn test_input_source_streams_first() {
        let mut handle = ProcessHandle::spawn(
            &spec(&["cat"]).with_stdin(StdinSource::Bytes(b"from source\n".to_vec())),
            &ProcessConfig::default(),
        )
        .unwrap();
        handle.send("then send\n").unwrap();
        handle.finish_input();
        assert!(handle.expect(StreamKind::Stdout, "from source\nthen send\n"));
    }

    #[test]
    fn test_stderr_is_separate() {
        let mut handle = ProcessHandle::spawn(
            &spec(&["sh", "-c", "echo out; echo err >&2"]),
            &ProcessConfig::default(),
        )
        .unwrap();
        assert_eq!(handle.readline(StreamKind::Stderr), "err\n");
        assert_eq!(handle.readline(StreamKind::Stdout), "out\n");
        assert!(handle.wall_time() < Duration::from_secs(30));
    }

    #[test]
    fn test_kill_after_reap_releases_empty_group() {
        let handle = ProcessHandle::spawn(&spec(&["true"]), &ProcessConfig::default()).unwrap();
        assert!(handle.assert_exit_status(0));
        assert!(!handle.shared().group_released());

        handle.kill();
        assert!(handle.shared().group_released());
        assert!(!process_group::registered_groups().contains(&handle.pid()));

        let report = handle.shared().kill_tree();
        assert!(!report.group_kill_sent);
    }

    #[test]
    fn test_kill_after_reap_reaches_surviving_members() {
        let mut handle = ProcessHandle::spawn(
            &spec(&["sh", "-c", "sleep 30 & echo started"]),
            &ProcessConfig::default(),
        )
        .unwrap();
        assert_eq!(handle.readline(StreamKind::Stdout), "started\n");
        assert!(handle.assert_exit_status(0));
        assert!(process_group::group_alive(handle.pid()));

        handle.kill();
        assert!(!handle.shared().group_released());
        let deadline = Instant::now() + Duration::from_secs(3);
        while process_group::group_alive(handle.pid()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!process_group::group_alive(handle.pid()));
    }

    #[test]
    fn test_dump_copies_remaining_output() {
        let mut handle = ProcessHandle::spawn(
            &spec(&["printf", "one\ntwo\n"]),
            &ProcessConfig::default(),
        )
        .unwrap();
        assert_eq!(handle.readline(StreamKind::Stdout), "one\n");
        let mut out = Vec::new();
        handle.dump_to(StreamKind::Stdout, &mut out).unwrap();
        assert_eq!(out, b"two\n");
        handle.dump(StreamKind::Stderr).unwrap();
    }

    #[test]
    fn test_ld_preload_is_exported() {
        let config = ProcessConfig {
            ld_preload: Some("/nonexistent/libprotect.so".into()),
            ..ProcessConfig::default()
        };
        // The loader warns about a missing preload but still runs the program.
        let mut handle =
            ProcessHandle::spawn(&spec(&["sh", "-c", "echo \"$LD_PRELOAD\""]), &config).unwrap();
        assert_eq!(
            handle.readline(StreamKind::Stdout),
            "/nonexistent/libprotect.so\n"
        );
    }
}
