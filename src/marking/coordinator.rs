/// MarkingCoordinator: enumerate, dispatch, collect, aggregate
use crate::config::config::MarkingOptions;
use crate::config::types::{MarksError, Result};
use crate::marking::aggregate::{self, Artifacts};
use crate::marking::pool::{WorkerPool, WorkerReport};
use crate::marking::result::ResultRecord;
use crate::marking::runnable::TestRunnable;
use crate::marking::worker::{MarkingHooks, Submission};
use chrono::Local;
use log::{info, warn};
use rand::seq::SliceRandom;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counts observed after each completed submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub marked: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.marked as f64 * 100.0 / self.total as f64
        }
    }
}

/// Outcome of a whole marking run
#[derive(Debug, Clone)]
pub struct MarkingSummary {
    /// One record per submission that completed; crashed ones carry no results
    pub records: Vec<ResultRecord>,
    pub executed: usize,
    pub crashed: Vec<String>,
    pub interrupted: bool,
    pub artifacts: Artifacts,
    pub elapsed: Duration,
}

/// Every immediate subdirectory of `root`, in directory order or shuffled
pub fn enumerate_submissions(root: &Path, random_order: bool) -> Result<Vec<Submission>> {
    let entries = std::fs::read_dir(root).map_err(|e| {
        MarksError::Config(format!("Cannot list {}: {}", root.display(), e))
    })?;

    let mut submissions = Vec::new();
    for entry in entries {
        let entry = entry?;
        // Follows symlinks, so linked submission directories are marked too
        if entry.path().is_dir() {
            submissions.push(Submission::from_path(entry.path()));
        }
    }

    if random_order {
        submissions.shuffle(&mut rand::thread_rng());
    }
    Ok(submissions)
}

pub struct MarkingCoordinator {
    options: MarkingOptions,
    runnable: Arc<dyn TestRunnable>,
    hooks: MarkingHooks,
    progress: Option<Box<dyn FnMut(Progress)>>,
}

impl MarkingCoordinator {
    pub fn new(options: MarkingOptions, runnable: Arc<dyn TestRunnable>) -> Self {
        Self {
            options,
            runnable,
            hooks: MarkingHooks::default(),
            progress: None,
        }
    }

    pub fn with_hooks(mut self, hooks: MarkingHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Observe `marked / total` as each worker completes
    pub fn on_progress(mut self, callback: impl FnMut(Progress) + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn options(&self) -> &MarkingOptions {
        &self.options
    }

    pub fn run(&mut self) -> Result<MarkingSummary> {
        let started_at = Local::now();
        let started = Instant::now();

        let submissions = enumerate_submissions(&self.options.directory, self.options.random_order)?;
        let total = submissions.len();
        info!("Starting marking: {} submissions", total);

        let mut records = Vec::with_capacity(total);
        let mut crashed = Vec::new();
        let mut executed = 0usize;
        let mut marked = 0usize;
        let progress = &mut self.progress;

        let pool = WorkerPool::new(self.runnable.as_ref(), &self.options, &self.hooks);
        let interrupted = pool.run(submissions, |report| {
            match report {
                WorkerReport::Marked {
                    record,
                    executed: ran,
                } => {
                    if ran {
                        executed += 1;
                    }
                    records.push(record);
                }
                WorkerReport::Crashed {
                    submission,
                    message,
                } => {
                    warn!("Submission {} has no result: {}", submission, message);
                    records.push(ResultRecord::empty(&submission));
                    crashed.push(submission);
                }
                WorkerReport::Interrupted { submission } => {
                    info!("Submission {} was not completed", submission);
                    return;
                }
            }

            marked += 1;
            let current = Progress { marked, total };
            info!("Marked {}/{} ({:.2}%)", marked, total, current.percent());
            if let Some(callback) = progress.as_mut() {
                callback(current);
            }
        });

        let artifacts = aggregate::write_aggregates(&records, &self.options.output_dir, &started_at)?;
        let elapsed = started.elapsed();
        info!("Time taken: {:?}", elapsed);

        Ok(MarkingSummary {
            records,
            executed,
            crashed,
            interrupted,
            artifacts,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_only_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("s1")).unwrap();
        std::fs::create_dir(dir.path().join("s2")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let mut ids: Vec<String> = enumerate_submissions(dir.path(), true)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn test_enumerate_follows_symlinked_directories() {
        let dir = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("alice")).unwrap();
        std::os::unix::fs::symlink(elsewhere.path(), dir.path().join("bob")).unwrap();
        std::os::unix::fs::symlink("/no/such/target", dir.path().join("dangling")).unwrap();

        let mut ids: Vec<String> = enumerate_submissions(dir.path(), false)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_enumerate_missing_root() {
        assert!(enumerate_submissions(Path::new("/no/such/root"), false).is_err());
    }

    #[test]
    fn test_progress_percent() {
        let progress = Progress { marked: 1, total: 4 };
        assert_eq!(progress.percent(), 25.0);
        assert_eq!(Progress { marked: 0, total: 0 }.percent(), 100.0);
    }
}
