// Startup validation for marking runs.
// Every check runs before any submission directory is touched.

use crate::config::config::MarkingOptions;
use crate::config::types::{MarksError, Result};
use std::time::Duration;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate marking options, failing fast with every problem found.
pub fn validate_options(options: &MarkingOptions) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if !options.directory.is_dir() {
        result.add_error(format!(
            "Submission directory does not exist or is not a directory: {}",
            options.directory.display()
        ));
    }

    if options.processes == 0 {
        result.add_error("Process count must be at least 1".to_string());
    }

    if options.results_filename.is_empty()
        || options.results_filename.contains(std::path::MAIN_SEPARATOR)
    {
        result.add_error(format!(
            "Results filename must be a plain file name, got '{}'",
            options.results_filename
        ));
    }

    if options.output_dir.exists() && !options.output_dir.is_dir() {
        result.add_error(format!(
            "Output path is not a directory: {}",
            options.output_dir.display()
        ));
    }

    if let Some(preload) = &options.process.ld_preload {
        if !preload.is_file() {
            result.add_error(format!(
                "Protection library not found: {}",
                preload.display()
            ));
        }
    }

    if options.process.default_timeout == Some(Duration::ZERO) {
        result.add_error("Default process timeout must be a positive number of seconds".to_string());
    }

    if options.resume && options.tally {
        result.add_warning("--resume has no effect together with --tally".to_string());
    }

    if options.process.default_timeout.is_none() {
        result.add_warning(
            "No default process timeout configured; runaway submissions rely on suite timeouts"
                .to_string(),
        );
    }

    if !result.is_valid() {
        return Err(MarksError::Config(format!(
            "Invalid marking options:\n{}",
            result.errors.join("\n")
        )));
    }

    for warning in &result.warnings {
        log::warn!("{}", warning);
    }

    Ok(result)
}
