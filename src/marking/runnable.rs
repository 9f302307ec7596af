/// The narrow interface the orchestrator depends on
use crate::config::config::MarkingOptions;
use crate::config::types::Result;
use crate::process::ProcessFactory;
use serde::{Deserialize, Serialize};

/// Identity and weighting of one test
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestInfo {
    pub id: String,
    /// Marks category; the empty string is the default category
    #[serde(default)]
    pub category: String,
    /// Marks awarded on success (default 1)
    #[serde(default)]
    pub mark: Option<f64>,
    /// Total marks for the whole category, shared by its tests
    #[serde(default)]
    pub category_marks: Option<f64>,
}

impl TestInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn in_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_mark(mut self, mark: f64) -> Self {
        self.mark = Some(mark);
        self
    }

    pub fn with_category_marks(mut self, marks: f64) -> Self {
        self.category_marks = Some(marks);
        self
    }
}

/// Receives test outcomes as a runnable executes
pub trait ResultSink {
    fn start_test(&mut self, _test: &TestInfo) {}

    fn add_success(&mut self, test: &TestInfo) -> Result<()>;

    /// `message` may embed a partial mark as `<<x>>`
    fn add_failure(&mut self, test: &TestInfo, message: &str) -> Result<()>;

    fn add_error(&mut self, test: &TestInfo, message: &str) -> Result<()>;

    fn add_detail(&mut self, name: &str, value: serde_json::Value);
}

/// Everything a runnable gets from the orchestrator besides its sink
#[derive(Debug, Clone)]
pub struct RunContext {
    factory: ProcessFactory,
    options: MarkingOptions,
}

impl RunContext {
    pub fn new(factory: ProcessFactory, options: MarkingOptions) -> Self {
        Self { factory, options }
    }

    /// Context whose factory follows the options' process settings
    pub fn from_options(options: MarkingOptions) -> Self {
        Self {
            factory: ProcessFactory::new(options.process.clone()),
            options,
        }
    }

    pub fn factory(&self) -> &ProcessFactory {
        &self.factory
    }

    pub fn options(&self) -> &MarkingOptions {
        &self.options
    }

    /// Pass-through option set with `-o name[=value]`
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.option(name)
    }
}

/// Anything that can run a test suite against the current directory
pub trait TestRunnable: Send + Sync {
    fn run(&self, sink: &mut dyn ResultSink, ctx: &RunContext) -> Result<()>;
}

impl<F> TestRunnable for F
where
    F: Fn(&mut dyn ResultSink, &RunContext) -> Result<()> + Send + Sync,
{
    fn run(&self, sink: &mut dyn ResultSink, ctx: &RunContext) -> Result<()> {
        self(sink, ctx)
    }
}
