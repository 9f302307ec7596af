/// Per-submission result records and the marking result sink
use crate::config::types::{MarksError, Result};
use crate::marking::runnable::{ResultSink, TestInfo};
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

pub const OUTCOME_SUCCESS: f64 = 1.0;
pub const OUTCOME_FAILURE: f64 = 0.0;
pub const OUTCOME_ERROR: f64 = 0.0;

/// Test ids grouped by outcome kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestLists {
    pub failures: Vec<String>,
    pub errors: Vec<String>,
    pub successes: Vec<String>,
}

/// Marks for one category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryMarks {
    /// Category-wide total, when the category is marked as a whole
    pub category_marks: Option<f64>,
    /// Sum of per-test marks, when tests are marked individually
    pub total_marks: f64,
    pub tests: Vec<f64>,
    pub passed: usize,
    pub mark: f64,
}

impl CategoryMarks {
    fn available(&self) -> f64 {
        self.category_marks.unwrap_or(self.total_marks)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub passed: usize,
    pub test_count: usize,
    pub received_marks: f64,
    pub total_marks: f64,
}

/// Structured outcome of one suite run on one submission.
///
/// A record carrying only `submission` means the submission has no result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub submission: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<TestLists>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marks: Option<BTreeMap<String, CategoryMarks>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totals: Option<Totals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, Value>>,
}

impl ResultRecord {
    /// Record for a submission with no usable result
    pub fn empty(submission: impl Into<String>) -> Self {
        Self {
            submission: submission.into(),
            ..Self::default()
        }
    }

    pub fn has_results(&self) -> bool {
        self.tests.is_some()
    }

    pub fn received_marks(&self) -> Option<f64> {
        self.totals.as_ref().map(|t| t.received_marks)
    }

    /// Load a persisted record; `None` if missing or unparseable
    pub fn load(path: &Path) -> Option<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                debug!("No prior result at {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(
                    "Ignoring corrupt result file {}: {}",
                    path.display(),
                    e
                );
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn partial_mark_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^.*<<(.*)>>").ok()).as_ref()
}

/// Partial mark embedded in the first line of a failure message as `<<x>>`.
/// With several markers on that line the last one counts.
pub fn partial_mark(message: &str) -> Option<f64> {
    let pattern = partial_mark_pattern()?;
    let captures = pattern.captures(message.lines().next()?)?;
    let raw = captures.get(1)?.as_str().trim();
    match raw.parse::<f64>() {
        Ok(mark) => Some(mark),
        Err(_) => {
            warn!("Ignoring malformed partial mark '{}'", raw);
            None
        }
    }
}

/// Result sink used in marking mode
#[derive(Debug, Default)]
pub struct MarkingResult {
    tests: BTreeMap<String, f64>,
    lists: TestLists,
    marks: BTreeMap<String, CategoryMarks>,
    details: BTreeMap<String, Value>,
    tests_run: usize,
}

impl MarkingResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tests_run(&self) -> usize {
        self.tests_run
    }

    fn record(&mut self, test: &TestInfo, outcome: f64) -> Result<()> {
        let entry = self.marks.entry(test.category.clone()).or_default();
        let is_first = entry.tests.is_empty();

        match (test.category_marks, entry.category_marks) {
            (Some(wanted), None) if is_first => entry.category_marks = Some(wanted),
            (Some(wanted), Some(existing)) if wanted != existing => {
                return Err(MarksError::Marks(format!(
                    "Differing total marks for category '{}' ({} vs {})",
                    test.category, existing, wanted
                )));
            }
            (Some(_), None) => {
                return Err(MarksError::Marks(format!(
                    "Category '{}' cannot have both category marks and individual test marks",
                    test.category
                )));
            }
            _ => {}
        }

        match (entry.category_marks, test.mark) {
            (Some(_), Some(_)) => {
                return Err(MarksError::Marks(format!(
                    "Category '{}' cannot have both category marks and individual test marks",
                    test.category
                )));
            }
            (Some(_), None) => {}
            (None, mark) => entry.total_marks += mark.unwrap_or(OUTCOME_SUCCESS),
        }

        entry.tests.push(outcome);
        self.tests.insert(test.id.clone(), outcome);
        Ok(())
    }

    /// Compute category and overall totals
    pub fn finish(self, submission: impl Into<String>) -> ResultRecord {
        let mut marks = self.marks;
        let mut totals = Totals::default();

        for info in marks.values_mut() {
            let count = info.tests.len();
            let sum: f64 = info.tests.iter().sum();
            let (passed, mark) = match info.category_marks {
                Some(category_marks) => {
                    let passed = info.tests.iter().filter(|o| **o == OUTCOME_SUCCESS).count();
                    let mark = if count == 0 {
                        0.0
                    } else {
                        sum / count as f64 * category_marks
                    };
                    (passed, mark)
                }
                None => {
                    let failed = info.tests.iter().filter(|o| **o == OUTCOME_FAILURE).count();
                    (count - failed, sum)
                }
            };
            info.passed = passed;
            info.mark = mark;

            totals.passed += passed;
            totals.test_count += count;
            totals.received_marks += mark;
            totals.total_marks += info.available();
        }

        ResultRecord {
            submission: submission.into(),
            tests: Some(self.tests),
            results: Some(self.lists),
            marks: Some(marks),
            totals: Some(totals),
            details: Some(self.details),
        }
    }
}

impl ResultSink for MarkingResult {
    fn start_test(&mut self, test: &TestInfo) {
        self.tests_run += 1;
        debug!("Running {}", test.id);
    }

    fn add_success(&mut self, test: &TestInfo) -> Result<()> {
        self.lists.successes.push(test.id.clone());
        let outcome = test.mark.unwrap_or(OUTCOME_SUCCESS);
        self.record(test, outcome)
    }

    fn add_failure(&mut self, test: &TestInfo, message: &str) -> Result<()> {
        self.lists.failures.push(test.id.clone());
        let outcome = partial_mark(message).unwrap_or(OUTCOME_FAILURE);
        self.record(test, outcome)
    }

    fn add_error(&mut self, test: &TestInfo, message: &str) -> Result<()> {
        debug!("{} errored: {}", test.id, message);
        self.lists.errors.push(test.id.clone());
        self.record(test, OUTCOME_ERROR)
    }

    fn add_detail(&mut self, name: &str, value: Value) {
        self.details.insert(name.to_string(), value);
    }
}
