//! Marking orchestrator
//!
//! Fans a [`TestRunnable`] out over every submission directory in forked
//! single-use workers, with resume/tally support and aggregate artifacts.

pub mod aggregate;
pub mod coordinator;
pub mod pool;
pub mod result;
pub mod runnable;
pub mod worker;

pub use coordinator::{enumerate_submissions, MarkingCoordinator, MarkingSummary, Progress};
pub use result::{MarkingResult, ResultRecord};
pub use runnable::{ResultSink, RunContext, TestInfo, TestRunnable};
pub use worker::{mark_one, MarkOutcome, MarkingHooks, Submission};
