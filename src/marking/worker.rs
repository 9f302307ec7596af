/// Marking a single submission
use crate::config::config::MarkingOptions;
use crate::config::types::{MarksError, Result};
use crate::kernel::signal;
use crate::marking::result::{MarkingResult, ResultRecord};
use crate::marking::runnable::{RunContext, TestRunnable};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Caller-supplied callback run with the submission's options
pub type Hook = Arc<dyn Fn(&MarkingOptions) + Send + Sync>;

/// Optional setup and teardown around each executed submission
#[derive(Clone, Default)]
pub struct MarkingHooks {
    pub setup: Option<Hook>,
    pub teardown: Option<Hook>,
}

impl std::fmt::Debug for MarkingHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkingHooks")
            .field("setup", &self.setup.is_some())
            .field("teardown", &self.teardown.is_some())
            .finish()
    }
}

/// One submission directory
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub path: PathBuf,
}

impl Submission {
    /// The identifier is the directory's base name
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self { id, path }
    }
}

/// Result of marking one submission
#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    /// A record was produced, loaded or synthesised
    Marked { record: ResultRecord, executed: bool },
    /// Operator cancellation; nothing was persisted
    Interrupted,
}

impl MarkOutcome {
    pub fn record(&self) -> Option<&ResultRecord> {
        match self {
            MarkOutcome::Marked { record, .. } => Some(record),
            MarkOutcome::Interrupted => None,
        }
    }
}

/// Restores the working directory on drop
struct DirGuard {
    previous: Option<PathBuf>,
}

impl DirGuard {
    fn enter(path: &Path) -> Result<Self> {
        let previous = std::env::current_dir().ok();
        std::env::set_current_dir(path).map_err(|e| {
            MarksError::Worker(format!("Cannot enter {}: {}", path.display(), e))
        })?;
        Ok(Self { previous })
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = std::env::set_current_dir(previous);
        }
    }
}

/// Mark one submission: resume, tally or execute.
pub fn mark_one(
    submission: &Submission,
    runnable: &dyn TestRunnable,
    options: &MarkingOptions,
    hooks: &MarkingHooks,
) -> Result<MarkOutcome> {
    let results_path = submission.path.join(&options.results_filename);
    info!("Start marking submission: {}", submission.id);

    if options.tally {
        let record = match ResultRecord::load(&results_path) {
            Some(record) => {
                info!(
                    "Loaded results for submission: {} ({})",
                    submission.id,
                    record.received_marks().unwrap_or(0.0)
                );
                record
            }
            None => {
                warn!("Could not load results for submission: {}", submission.id);
                ResultRecord::empty(&submission.id)
            }
        };
        return Ok(MarkOutcome::Marked {
            record,
            executed: false,
        });
    }

    if options.resume {
        if let Some(record) = ResultRecord::load(&results_path).filter(ResultRecord::has_results) {
            info!("Resumed submission: {}", submission.id);
            return Ok(MarkOutcome::Marked {
                record,
                executed: false,
            });
        }
    }

    if !signal::should_continue() {
        return Ok(MarkOutcome::Interrupted);
    }

    let _cwd = DirGuard::enter(&submission.path)?;

    let mut submission_options = options.clone();
    submission_options
        .extra
        .insert("submission".to_string(), submission.id.clone());

    if let Some(setup) = &hooks.setup {
        setup(&submission_options);
    }

    let ctx = RunContext::from_options(submission_options.clone());
    let mut sink = MarkingResult::new();
    let outcome = runnable.run(&mut sink, &ctx);

    if let Some(teardown) = &hooks.teardown {
        teardown(&submission_options);
    }

    if !signal::should_continue() {
        info!("Marking of {} interrupted", submission.id);
        return Ok(MarkOutcome::Interrupted);
    }
    outcome?;

    let record = sink.finish(&submission.id);
    record.save(&results_path)?;
    info!(
        "Finished marking submission: {} ({})",
        submission.id,
        record.received_marks().unwrap_or(0.0)
    );

    Ok(MarkOutcome::Marked {
        record,
        executed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marking::runnable::{ResultSink, TestInfo};
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn passing_runnable(runs: Arc<AtomicUsize>) -> impl TestRunnable {
        move |sink: &mut dyn ResultSink, _ctx: &RunContext| -> Result<()> {
            runs.fetch_add(1, Ordering::SeqCst);
            let test = TestInfo::new("t1");
            sink.start_test(&test);
            sink.add_success(&test)
        }
    }

    #[test]
    fn test_submission_id_is_basename() {
        let submission = Submission::from_path("/srv/subs/s4412345/");
        assert_eq!(submission.id, "s4412345");
    }

    #[test]
    #[serial(interrupt)]
    fn test_execute_then_resume() {
        signal::reset();
        let dir = tempfile::tempdir().unwrap();
        let sub_dir = dir.path().join("alice");
        std::fs::create_dir(&sub_dir).unwrap();
        let submission = Submission::from_path(&sub_dir);
        let runs = Arc::new(AtomicUsize::new(0));
        let runnable = passing_runnable(runs.clone());

        let mut options = MarkingOptions::new(dir.path());
        let first = mark_one(&submission, &runnable, &options, &MarkingHooks::default()).unwrap();
        assert!(matches!(first, MarkOutcome::Marked { executed: true, .. }));
        assert!(sub_dir.join("results.json").exists());

        options.resume = true;
        let second = mark_one(&submission, &runnable, &options, &MarkingHooks::default()).unwrap();
        assert!(matches!(second, MarkOutcome::Marked { executed: false, .. }));
        assert_eq!(first.record(), second.record());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial(interrupt)]
    fn test_resume_keeps_fractional_marks() {
        signal::reset();
        let dir = tempfile::tempdir().unwrap();
        let sub_dir = dir.path().join("carol");
        std::fs::create_dir(&sub_dir).unwrap();
        let submission = Submission::from_path(&sub_dir);
        let runnable = |sink: &mut dyn ResultSink, _ctx: &RunContext| -> Result<()> {
            for id in ["a", "b", "c"] {
                let test = TestInfo::new(id)
                    .in_category("parsing")
                    .with_category_marks(10.0 / 7.0);
                sink.start_test(&test);
                match id {
                    "a" => sink.add_success(&test)?,
                    "b" => sink.add_failure(&test, "close <<0.3>>")?,
                    _ => sink.add_failure(&test, "wrong")?,
                }
            }
            Ok(())
        };

        let mut options = MarkingOptions::new(dir.path());
        let first = mark_one(&submission, &runnable, &options, &MarkingHooks::default()).unwrap();
        let marks = first.record().unwrap().received_marks().unwrap();
        assert!(marks.fract() != 0.0);

        options.resume = true;
        let second = mark_one(&submission, &runnable, &options, &MarkingHooks::default()).unwrap();
        assert!(matches!(second, MarkOutcome::Marked { executed: false, .. }));
        assert_eq!(first.record(), second.record());
    }

    #[test]
    #[serial(interrupt)]
    fn test_tally_without_results() {
        signal::reset();
        let dir = tempfile::tempdir().unwrap();
        let submission = Submission::from_path(dir.path());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut options = MarkingOptions::new(dir.path());
        options.tally = true;

        let outcome = mark_one(
            &submission,
            &passing_runnable(runs.clone()),
            &options,
            &MarkingHooks::default(),
        )
        .unwrap();
        let record = outcome.record().unwrap();
        assert!(!record.has_results());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[serial(interrupt)]
    fn test_hooks_see_submission() {
        signal::reset();
        let dir = tempfile::tempdir().unwrap();
        let submission = Submission::from_path(dir.path());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let setup_seen = seen.clone();
        let hooks = MarkingHooks {
            setup: Some(Arc::new(move |opts: &MarkingOptions| {
                setup_seen
                    .lock()
                    .unwrap()
                    .push(opts.option("submission").unwrap_or_default().to_string());
            })),
            teardown: None,
        };
        let options = MarkingOptions::new(dir.path());
        mark_one(
            &submission,
            &passing_runnable(Arc::new(AtomicUsize::new(0))),
            &options,
            &hooks,
        )
        .unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), [submission.id.clone()]);
    }

    #[test]
    #[serial(interrupt)]
    fn test_interrupted_run_is_not_persisted() {
        signal::reset();
        let dir = tempfile::tempdir().unwrap();
        let submission = Submission::from_path(dir.path());
        let runnable = |sink: &mut dyn ResultSink, _ctx: &RunContext| -> Result<()> {
            signal::request_shutdown();
            sink.add_success(&TestInfo::new("t"))
        };
        let options = MarkingOptions::new(dir.path());
        let outcome = mark_one(&submission, &runnable, &options, &MarkingHooks::default()).unwrap();
        signal::reset();
        assert_eq!(outcome, MarkOutcome::Interrupted);
        assert!(!dir.path().join("results.json").exists());
    }
}
