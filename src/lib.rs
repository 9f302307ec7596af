//! rustmarks: black-box marking of student submissions
//! Runs untrusted executables under process-group control and turns what they
//! do into marks, one isolated worker process per submission.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::signal`]: Async-safe operator interrupt handling
//! - [`kernel::process_group`]: Group signalling and per-process group ownership
//! - [`kernel::ptrace`]: Fork/vfork/clone event tracing of a whole subtree
//!
//! ## Process Control ([`process`])
//! - [`process::handle`]: One child per handle, threaded stdio, write-once termination
//! - [`process::traced`]: Handles that record every descendant as it is forked
//! - [`process::factory`]: Execution contract and the per-run spawn strategy
//! - [`process::stream`]: Line readers and the queued stdin writer
//!
//! ## Marking ([`marking`])
//! - [`marking::runnable`]: The `TestRunnable` / `ResultSink` seam
//! - [`marking::result`]: Result records and marks computation
//! - [`marking::worker`]: Marking one submission (execute, resume, tally)
//! - [`marking::pool`]: Forked single-use workers
//! - [`marking::coordinator`]: Enumeration, dispatch, progress
//! - [`marking::aggregate`]: JSON, CSV and no-result artifacts
//!
//! ## Suites ([`suite`])
//! - Declarative command suites loaded from JSON
//!
//! ## Configuration ([`config`])
//! - [`config::config`]: Config file loading and the option snapshot
//! - [`config::validator`]: Fail-fast option validation
//! - [`config::types`]: Shared types and the error enum
//!
//! # Design Principles
//!
//! 1. **The process group is the unit of ownership** - kill and signal whole groups
//! 2. **Terminal state is written once** - by whichever thread reaps the child
//! 3. **Every wait has a deadline** - unless the caller configured none
//! 4. **Crashes stay local** - one submission per worker process

// Kernel Primitives
pub mod kernel;

// Process Control
pub mod process;

// Marking
pub mod marking;

// Suites
pub mod suite;

// Configuration
pub mod config;

// CLI entrypoint wiring for the marks binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
