/// Core types and structures shared by the process controller and the marker
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Output stream of a child process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Recorded terminal cause of a child process.
///
/// Set exactly once by whichever thread reaps the child. `TimedOut` wins over
/// the raw wait status when the watchdog fired before the child was reaped;
/// the signal that actually ended it is kept for diagnostics only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum Termination {
    Exited { code: i32 },
    Signalled { signal: i32 },
    TimedOut { signal: Option<i32> },
}

impl Termination {
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Termination::Exited { code } => Some(*code),
            _ => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            Termination::Signalled { signal } => Some(*signal),
            _ => None,
        }
    }

    pub fn signalled(&self) -> bool {
        matches!(self, Termination::Signalled { .. })
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, Termination::TimedOut { .. })
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited { code } => write!(f, "exited with status {}", code),
            Termination::Signalled { signal } => write!(f, "terminated by signal {}", signal),
            Termination::TimedOut { .. } => write!(f, "timed out"),
        }
    }
}

/// Which process implementation a test run uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStrategy {
    /// Plain child in its own process group
    #[default]
    Plain,
    /// Child traced with ptrace so every forked descendant is recorded
    Traced,
}

/// Source of bytes streamed to a child's stdin before explicit sends
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdinSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// Custom error types for rustmarks
#[derive(Error, Debug)]
pub enum MarksError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("Input to process {pid} has already been closed")]
    InputClosed { pid: i32 },

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Trace error: {0}")]
    Trace(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Marks error: {0}")]
    Marks(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl MarksError {
    pub fn is_spawn(&self) -> bool {
        matches!(self, MarksError::Spawn { .. })
    }
}

/// Result type alias for rustmarks operations
pub type Result<T> = std::result::Result<T, MarksError>;

impl From<nix::errno::Errno> for MarksError {
    fn from(err: nix::errno::Errno) -> Self {
        MarksError::Signal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_accessors_are_exclusive() {
        let exited = Termination::Exited { code: 3 };
        assert_eq!(exited.exit_status(), Some(3));
        assert!(!exited.signalled());
        assert_eq!(exited.signal(), None);

        let signalled = Termination::Signalled { signal: 15 };
        assert_eq!(signalled.exit_status(), None);
        assert!(signalled.signalled());
        assert_eq!(signalled.signal(), Some(15));

        let timed_out = Termination::TimedOut { signal: Some(9) };
        assert!(timed_out.timed_out());
        assert!(!timed_out.signalled());
        assert_eq!(timed_out.exit_status(), None);
        assert_eq!(timed_out.signal(), None);
    }

    #[test]
    fn termination_serializes_with_cause_tag() {
        let json = serde_json::to_string(&Termination::Exited { code: 0 }).unwrap();
        assert_eq!(json, r#"{"cause":"exited","code":0}"#);
    }

    #[test]
    fn stream_kind_display() {
        assert_eq!(StreamKind::Stdout.to_string(), "stdout");
        assert_eq!(StreamKind::Stderr.to_string(), "stderr");
    }
}
