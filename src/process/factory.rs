/// Process execution contract and the per-run spawn strategy
use crate::config::config::ProcessConfig;
use crate::config::types::{MarksError, ProcessStrategy, Result, StdinSource};
use crate::process::handle::ProcessHandle;
use crate::process::traced::TracedProcessHandle;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to run: argv, optional stdin source, optional timeout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    #[serde(default)]
    pub stdin: Option<StdinSource>,
    /// `None` means unbounded (or the factory default, when one is set)
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            stdin: None,
            timeout: None,
        }
    }

    pub fn with_stdin(mut self, stdin: StdinSource) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// Whole-second timeout; zero is rejected
    pub fn timeout_secs(mut self, seconds: u64) -> Result<Self> {
        if seconds == 0 {
            return Err(MarksError::Config(
                "Process timeout must be a positive number of seconds".to_string(),
            ));
        }
        self.timeout = Some(Duration::from_secs(seconds));
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        match self.argv.first() {
            Some(program) if !program.is_empty() => Ok(()),
            _ => Err(MarksError::Spawn {
                program: String::new(),
                reason: "empty argv".to_string(),
            }),
        }
    }
}

/// Spawn strategy chosen once per run from configuration and handed to
/// every runnable, instead of swapping process types at runtime.
#[derive(Debug, Clone, Default)]
pub struct ProcessFactory {
    config: ProcessConfig,
}

impl ProcessFactory {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn strategy(&self) -> ProcessStrategy {
        self.config.strategy
    }

    /// Spawn with the configured strategy
    pub fn spawn(&self, spec: &ProcessSpec) -> Result<ProcessHandle> {
        match self.config.strategy {
            ProcessStrategy::Plain => ProcessHandle::spawn(spec, &self.config),
            ProcessStrategy::Traced => {
                TracedProcessHandle::spawn(spec, &self.config).map(TracedProcessHandle::into_handle)
            }
        }
    }

    /// Spawn under ptrace regardless of the configured strategy
    pub fn spawn_traced(&self, spec: &ProcessSpec) -> Result<TracedProcessHandle> {
        TracedProcessHandle::spawn(spec, &self.config)
    }
}
