//! Thin wrappers around Linux process-control primitives.
//!
//! All `unsafe` and ptrace code is concentrated here.
//! Dependency direction: signal -> process_group -> ptrace

pub mod process_group;
pub mod ptrace;
pub mod signal;
