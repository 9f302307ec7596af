/// Process group signalling and ownership tracking
///
/// Every child spawned by the process controller leads its own process group.
/// Groups are registered here while alive so an interrupted worker can kill
/// exactly the groups it created, and nothing else.
use crate::config::types::Result;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Mutex, OnceLock};

fn owned_groups() -> &'static Mutex<BTreeSet<i32>> {
    static GROUPS: OnceLock<Mutex<BTreeSet<i32>>> = OnceLock::new();
    GROUPS.get_or_init(|| Mutex::new(BTreeSet::new()))
}

/// Record a process group created by this process
pub fn register_group(pgid: i32) {
    if let Ok(mut groups) = owned_groups().lock() {
        groups.insert(pgid);
    }
}

/// Forget a process group once its leader has been reaped
pub fn unregister_group(pgid: i32) {
    if let Ok(mut groups) = owned_groups().lock() {
        groups.remove(&pgid);
    }
}

/// Snapshot of the groups currently owned by this process
pub fn registered_groups() -> Vec<i32> {
    owned_groups()
        .lock()
        .map(|groups| groups.iter().copied().collect())
        .unwrap_or_default()
}

/// SIGKILL every registered group. Used on operator interrupt.
pub fn kill_registered_groups() -> usize {
    let groups = registered_groups();
    for pgid in &groups {
        if let Err(e) = signal_group(*pgid, Signal::SIGKILL) {
            warn!("Failed to kill process group {}: {}", pgid, e);
        }
    }
    groups.len()
}

/// Deliver a signal to one process. A process that is already gone is not an error.
pub fn signal_process(pid: i32, sig: Signal) -> Result<()> {
    match signal::kill(Pid::from_raw(pid), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            debug!("Process {} already gone, {} not delivered", pid, sig);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Deliver a signal to a whole process group. A group that is already gone is not an error.
pub fn signal_group(pgid: i32, sig: Signal) -> Result<()> {
    match signal::killpg(Pid::from_raw(pgid), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            debug!("Process group {} already gone, {} not delivered", pgid, sig);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Check whether any member of a process group is still schedulable
pub fn group_alive(pgid: i32) -> bool {
    signal::killpg(Pid::from_raw(pgid), None).is_ok()
}

/// Signal escalation report for forced termination paths
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KillReport {
    pub group_kill_sent: bool,
    pub tasks_killed: usize,
    pub notes: Vec<String>,
}

/// SIGKILL a process group plus any extra tasks known to belong to it.
///
/// Extra tasks cover traced descendants that moved to another group.
pub fn kill_tree(pgid: i32, extra_tasks: &BTreeSet<i32>) -> KillReport {
    let mut report = KillReport::default();

    match signal_group(pgid, Signal::SIGKILL) {
        Ok(()) => report.group_kill_sent = true,
        Err(e) => {
            // Fall back to the leader alone
            let _ = signal_process(pgid, Signal::SIGKILL);
            report
                .notes
                .push(format!("group SIGKILL fallback used: {}", e));
        }
    }

    for pid in extra_tasks {
        if *pid == pgid {
            continue;
        }
        match signal_process(*pid, Signal::SIGKILL) {
            Ok(()) => report.tasks_killed += 1,
            Err(e) => report.notes.push(format!("SIGKILL {} failed: {}", pid, e)),
        }
    }

    report
}
