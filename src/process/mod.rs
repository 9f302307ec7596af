//! Process controller
//!
//! Spawns one child per handle as the leader of a new process group, with
//! threaded stdio, a deadline watchdog and write-once terminal state. The
//! traced variant records every descendant through ptrace.

pub mod factory;
pub mod handle;
pub mod stream;
pub mod traced;
mod watchdog;

pub use factory::{ProcessFactory, ProcessSpec};
pub use handle::ProcessHandle;
pub use traced::TracedProcessHandle;
