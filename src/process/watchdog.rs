use crate::process::handle::Shared;
use log::debug;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Arm a per-handle deadline.
///
/// The thread sleeps on the handle's state condvar, so it exits as soon as the
/// child is reaped. On expiry it marks the handle timed out and kills the tree.
pub(crate) fn arm(shared: Arc<Shared>, deadline: Instant) {
    let spawned = thread::Builder::new()
        .name(format!("watchdog-{}", shared.pid()))
        .spawn(move || {
            if shared.wait_terminated(Some(deadline)).is_none() {
                debug!("Process {} reached its deadline", shared.pid());
                shared.expire();
            }
        });

    if let Err(e) = spawned {
        // Without a watchdog the deadline is still enforced by reads and waits.
        log::warn!("Failed to start watchdog thread: {}", e);
    }
}
