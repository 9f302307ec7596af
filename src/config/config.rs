use crate::config::types::{MarksError, ProcessStrategy, Result};
/// Configuration loading and the immutable option snapshot handed to workers
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of marking worker processes
pub const DEFAULT_PROCESSES: usize = 4;

/// Default per-submission result file name
pub const DEFAULT_RESULTS_FILENAME: &str = "results.json";

/// Default limit on live traced tasks before the whole tree is killed
pub const DEFAULT_DESCENDANT_LIMIT: usize = 20;

/// Default grace period a kill waits for the child to be reaped
pub const DEFAULT_KILL_GRACE_MS: u64 = 1000;

/// Process controller settings, fixed for a whole test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub strategy: ProcessStrategy,
    /// Library injected through LD_PRELOAD into every spawned child
    pub ld_preload: Option<PathBuf>,
    /// Timeout applied when a spawn request does not carry its own
    pub default_timeout: Option<Duration>,
    /// Live traced task count that triggers a tree kill (traced strategy only)
    pub descendant_limit: Option<usize>,
    pub kill_grace: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            strategy: ProcessStrategy::Plain,
            ld_preload: None,
            default_timeout: None,
            descendant_limit: Some(DEFAULT_DESCENDANT_LIMIT),
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
        }
    }
}

/// Optional marks.json structure. Every field may be omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkingConfig {
    pub processes: Option<usize>,
    pub results_filename: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub ld_preload: Option<PathBuf>,
    pub traced: Option<bool>,
    pub default_timeout_seconds: Option<u64>,
    pub descendant_limit: Option<usize>,
    pub kill_grace_ms: Option<u64>,
    pub random_order: Option<bool>,
    pub options: BTreeMap<String, String>,
}

impl MarkingConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MarksError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: MarkingConfig = serde_json::from_str(&content)
            .map_err(|e| MarksError::Config(format!("Failed to parse config JSON: {}", e)))?;

        Ok(config)
    }

    /// Load ./marks.json if present, defaults otherwise
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::current_dir()
            .map_err(|e| MarksError::Config(format!("Failed to get current directory: {}", e)))?
            .join("marks.json");

        if !config_path.exists() {
            return Ok(Self::default());
        }

        Self::load_from_file(config_path)
    }

    /// Process controller settings described by this file
    pub fn process_config(&self) -> ProcessConfig {
        let mut process = ProcessConfig::default();
        self.merge_process(&mut process);
        process
    }

    /// Overwrite each process field this file sets; unset fields are untouched
    pub fn merge_process(&self, process: &mut ProcessConfig) {
        if let Some(traced) = self.traced {
            process.strategy = if traced {
                ProcessStrategy::Traced
            } else {
                ProcessStrategy::Plain
            };
        }
        if let Some(path) = &self.ld_preload {
            process.ld_preload = Some(path.clone());
        }
        if let Some(seconds) = self.default_timeout_seconds {
            process.default_timeout = Some(Duration::from_secs(seconds));
        }
        if let Some(limit) = self.descendant_limit {
            process.descendant_limit = Some(limit);
        }
        if let Some(ms) = self.kill_grace_ms {
            process.kill_grace = Duration::from_millis(ms);
        }
    }
}

/// Immutable configuration snapshot passed to every marking worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkingOptions {
    /// Parent directory holding one subdirectory per submission
    pub directory: PathBuf,
    /// Directory the marker was started from
    pub working_dir: PathBuf,
    /// Where aggregate artifacts are written
    pub output_dir: PathBuf,
    pub resume: bool,
    pub tally: bool,
    pub processes: usize,
    pub random_order: bool,
    pub results_filename: String,
    pub process: ProcessConfig,
    /// Pass-through flags for the test engine (`-o key=value`)
    pub extra: BTreeMap<String, String>,
}

impl MarkingOptions {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            output_dir: directory.clone(),
            directory,
            working_dir,
            resume: false,
            tally: false,
            processes: DEFAULT_PROCESSES,
            random_order: false,
            results_filename: DEFAULT_RESULTS_FILENAME.to_string(),
            process: ProcessConfig::default(),
            extra: BTreeMap::new(),
        }
    }

    /// Take every value the config file sets.
    ///
    /// Runs before command-line flags are applied so that each flag the
    /// operator gives overrides its file counterpart field by field.
    pub fn apply_config(&mut self, config: &MarkingConfig) {
        if let Some(processes) = config.processes {
            self.processes = processes;
        }
        if let Some(name) = &config.results_filename {
            self.results_filename = name.clone();
        }
        if let Some(dir) = &config.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(random_order) = config.random_order {
            self.random_order = random_order;
        }
        config.merge_process(&mut self.process);
        for (key, value) in &config.options {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    /// Look up a pass-through option
    pub fn option(&self, name: &str) -> Option<&str> {
        self.extra.get(name).map(String::as_str)
    }

    /// Parse `-o name[=value]` flags; bare names become "true".
    /// The first occurrence of a name wins; flags replace config-file values.
    pub fn add_pass_through(&mut self, raw: &[String]) {
        let mut given = BTreeMap::new();
        for opt in raw {
            let (name, value) = match opt.split_once('=') {
                Some((name, value)) => (name.to_string(), value.to_string()),
                None => (opt.clone(), "true".to_string()),
            };
            given.entry(name).or_insert(value);
        }
        self.extra.extend(given);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marking_options_defaults() {
        let options = MarkingOptions::new("/tmp/subs");
        assert_eq!(options.processes, DEFAULT_PROCESSES);
        assert_eq!(options.results_filename, "results.json");
        assert_eq!(options.output_dir, PathBuf::from("/tmp/subs"));
        assert!(!options.resume);
        assert!(!options.tally);
        assert_eq!(options.process.strategy, ProcessStrategy::Plain);
    }

    #[test]
    fn test_pass_through_parsing() {
        let mut options = MarkingOptions::new("/tmp/subs");
        options.add_pass_through(&[
            "fuzzy".to_string(),
            "port=4000".to_string(),
            "port=5000".to_string(),
        ]);
        assert_eq!(options.option("fuzzy"), Some("true"));
        assert_eq!(options.option("port"), Some("4000"));
        assert_eq!(options.option("missing"), None);
    }

    #[test]
    fn test_config_file_fills_unset_fields() {
        let mut options = MarkingOptions::new("/tmp/subs");
        let config: MarkingConfig = serde_json::from_str(
            r#"{"processes": 2, "results_filename": "marks.json", "traced": true,
                "default_timeout_seconds": 5, "options": {"port": "4000"}}"#,
        )
        .unwrap();
        options.apply_config(&config);

        assert_eq!(options.processes, 2);
        assert_eq!(options.results_filename, "marks.json");
        assert_eq!(options.process.strategy, ProcessStrategy::Traced);
        assert_eq!(options.process.default_timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.option("port"), Some("4000"));
    }

    #[test]
    fn test_process_fields_merge_one_by_one() {
        let config: MarkingConfig = serde_json::from_str(
            r#"{"ld_preload": "/lib/protect.so", "descendant_limit": 5, "kill_grace_ms": 250}"#,
        )
        .unwrap();
        let mut process = ProcessConfig {
            strategy: ProcessStrategy::Traced,
            ..ProcessConfig::default()
        };
        config.merge_process(&mut process);

        assert_eq!(process.strategy, ProcessStrategy::Traced);
        assert_eq!(process.ld_preload, Some(PathBuf::from("/lib/protect.so")));
        assert_eq!(process.descendant_limit, Some(5));
        assert_eq!(process.kill_grace, Duration::from_millis(250));
    }

    #[test]
    fn test_pass_through_replaces_config_option() {
        let mut options = MarkingOptions::new("/tmp/subs");
        let config: MarkingConfig =
            serde_json::from_str(r#"{"options": {"port": "4000", "fuzzy": "false"}}"#).unwrap();
        options.apply_config(&config);
        options.add_pass_through(&["port=5000".to_string()]);

        assert_eq!(options.option("port"), Some("5000"));
        assert_eq!(options.option("fuzzy"), Some("false"));
    }

    #[test]
    fn test_empty_config_parses() {
        let config: MarkingConfig = serde_json::from_str("{}").unwrap();
        assert!(config.processes.is_none());
        assert_eq!(config.process_config(), ProcessConfig::default());
    }
}
