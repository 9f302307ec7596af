//! Declarative command suites
//!
//! A suite file lists commands to run inside each submission directory and
//! what their output and exit should look like. It is the runnable the `marks`
//! binary drives; library users can supply any other [`TestRunnable`].

use crate::config::types::{MarksError, Result, StdinSource, StreamKind, Termination};
use crate::kernel::signal;
use crate::marking::runnable::{ResultSink, RunContext, TestInfo, TestRunnable};
use crate::process::{ProcessHandle, ProcessSpec};
use log::debug;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Literal text or a file whose full contents are expected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    File { file: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteTest {
    pub id: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub mark: Option<f64>,
    #[serde(default)]
    pub category_marks: Option<f64>,
    pub argv: Vec<String>,
    #[serde(default)]
    pub stdin: Option<Content>,
    /// Seconds; falls back to the suite timeout
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub expect_stdout: Option<Content>,
    #[serde(default)]
    pub expect_stderr: Option<Content>,
    #[serde(default)]
    pub exit_status: Option<i32>,
    /// Signal number the process must be killed by
    #[serde(default)]
    pub signal: Option<i32>,
}

impl SuiteTest {
    fn info(&self) -> TestInfo {
        TestInfo {
            id: self.id.clone(),
            category: self.category.clone(),
            mark: self.mark,
            category_marks: self.category_marks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSuite {
    #[serde(default)]
    pub name: String,
    /// Default per-test timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    pub tests: Vec<SuiteTest>,
    /// Directory relative content files are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl CommandSuite {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MarksError::Config(format!("Failed to read suite {}: {}", path.display(), e))
        })?;
        let mut suite: CommandSuite = serde_json::from_str(&content).map_err(|e| {
            MarksError::Config(format!("Failed to parse suite {}: {}", path.display(), e))
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        suite.base_dir = std::fs::canonicalize(base).unwrap_or_else(|_| base.to_path_buf());
        suite.validate()?;
        Ok(suite)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for test in &self.tests {
            if test.argv.is_empty() {
                return Err(MarksError::Config(format!("Test '{}' has an empty argv", test.id)));
            }
            if !seen.insert(test.id.as_str()) {
                return Err(MarksError::Config(format!("Duplicate test id '{}'", test.id)));
            }
            if test.timeout == Some(0) || self.timeout == Some(0) {
                return Err(MarksError::Config(format!(
                    "Test '{}' has a zero timeout",
                    test.id
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn process_spec(&self, test: &SuiteTest) -> ProcessSpec {
        let mut spec = ProcessSpec::new(test.argv.clone());
        spec.stdin = test.stdin.as_ref().map(|content| match content {
            Content::Text(text) => StdinSource::Bytes(text.clone().into_bytes()),
            Content::File { file } => StdinSource::File(self.resolve(file)),
        });
        spec.timeout = test.timeout.or(self.timeout).map(Duration::from_secs);
        spec
    }

    fn check_stream(
        &self,
        handle: &mut ProcessHandle,
        stream: StreamKind,
        expected: &Content,
        problems: &mut Vec<String>,
    ) {
        let matched = match expected {
            Content::Text(text) => handle.expect(stream, text),
            Content::File { file } => handle.expect_file(stream, self.resolve(file)),
        };
        if !matched {
            problems.push(format!("{} did not match", stream));
        }
    }

    /// Run one test; the returned list is empty when it passed
    fn run_test(&self, test: &SuiteTest, ctx: &RunContext) -> Result<Vec<String>> {
        let mut handle = ctx.factory().spawn(&self.process_spec(test))?;
        handle.finish_input();

        let mut problems = Vec::new();
        if let Some(expected) = &test.expect_stdout {
            self.check_stream(&mut handle, StreamKind::Stdout, expected, &mut problems);
        }
        if let Some(expected) = &test.expect_stderr {
            self.check_stream(&mut handle, StreamKind::Stderr, expected, &mut problems);
        }

        let termination = handle.wait();
        if handle.timed_out() {
            problems.push("timed out".to_string());
            return Ok(problems);
        }

        match (test.signal, test.exit_status) {
            (Some(sig), _) => {
                let matches = Signal::try_from(sig)
                    .map(|sig| handle.assert_signal(sig))
                    .unwrap_or(false);
                if !matches {
                    problems.push(format!(
                        "expected signal {}, got {}",
                        sig,
                        describe(termination)
                    ));
                }
            }
            (None, Some(code)) => {
                if !handle.assert_exit_status(code) {
                    problems.push(format!(
                        "expected exit status {}, got {}",
                        code,
                        describe(termination)
                    ));
                }
            }
            (None, None) => {}
        }

        Ok(problems)
    }
}

fn describe(termination: Option<Termination>) -> String {
    termination
        .map(|t| t.to_string())
        .unwrap_or_else(|| "no termination".to_string())
}

impl TestRunnable for CommandSuite {
    fn run(&self, sink: &mut dyn ResultSink, ctx: &RunContext) -> Result<()> {
        for test in &self.tests {
            if !signal::should_continue() {
                break;
            }
            let info = test.info();
            sink.start_test(&info);
            match self.run_test(test, ctx) {
                Ok(problems) if problems.is_empty() => sink.add_success(&info)?,
                Ok(problems) => sink.add_failure(&info, &problems.join("; "))?,
                Err(e) => {
                    debug!("Test {} could not run: {}", test.id, e);
                    sink.add_error(&info, &e.to_string())?
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::MarkingOptions;
    use crate::marking::result::MarkingResult;
    use serial_test::serial;

    fn suite_from(json: &str, base: &Path) -> CommandSuite {
        let mut suite: CommandSuite = serde_json::from_str(json).unwrap();
        suite.base_dir = base.to_path_buf();
        suite.validate().unwrap();
        suite
    }

    #[test]
    fn test_content_forms_parse() {
        let text: Content = serde_json::from_str(r#""hi\n""#).unwrap();
        assert_eq!(text, Content::Text("hi\n".to_string()));
        let file: Content = serde_json::from_str(r#"{"file": "out.txt"}"#).unwrap();
        assert_eq!(file, Content::File { file: "out.txt".into() });
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let suite: CommandSuite = serde_json::from_str(
            r#"{"tests": [{"id": "a", "argv": ["true"]}, {"id": "a", "argv": ["true"]}]}"#,
        )
        .unwrap();
        assert!(suite.validate().is_err());
    }

    #[test]
    #[serial(interrupt)]
    fn test_suite_records_outcomes() {
        signal::reset();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("expected.txt"), "hello\n").unwrap();
        let suite = suite_from(
            r#"{
                "timeout": 10,
                "tests": [
                    {"id": "echo", "argv": ["echo", "hello"],
                     "expect_stdout": {"file": "expected.txt"}, "exit_status": 0},
                    {"id": "cat", "argv": ["cat"], "stdin": "abc",
                     "expect_stdout": "abc"},
                    {"id": "wrong", "argv": ["sh", "-c", "exit 2"], "exit_status": 0},
                    {"id": "missing", "argv": ["/no/such/binary"]},
                    {"id": "killed", "argv": ["sh", "-c", "kill -TERM $$"], "signal": 15}
                ]
            }"#,
            dir.path(),
        );

        let ctx = RunContext::from_options(MarkingOptions::new(dir.path()));
        let mut sink = MarkingResult::new();
        suite.run(&mut sink, &ctx).unwrap();
        let record = sink.finish("s");
        let lists = record.results.unwrap();
        assert_eq!(lists.successes, vec!["echo", "cat", "killed"]);
        assert_eq!(lists.failures, vec!["wrong"]);
        assert_eq!(lists.errors, vec!["missing"]);
        assert_eq!(record.totals.unwrap().received_marks, 3.0);
    }
}
