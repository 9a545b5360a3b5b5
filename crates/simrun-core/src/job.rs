use crate::identity::{job_dir_for, resolve, IdentityError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Target amount of work for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunOptions {
    pub n_runs: usize,
    pub n_files: usize,
    /// Delete all run data before reconciling.
    #[serde(default)]
    pub clean: bool,
    /// Re-analyze every run even when its analysis is current.
    #[serde(default)]
    pub analyze: bool,
}

/// One unit of requested work.
///
/// The configuration is copied on construction and never exposed mutably,
/// so a caller reusing its config value for the next variant cannot change
/// a job that was already built.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    base_dir: PathBuf,
    config: Value,
    run_options: RunOptions,
    label: Option<String>,
}

impl JobDescriptor {
    pub fn new(base_dir: impl Into<PathBuf>, config: &Value, run_options: RunOptions) -> Self {
        Self {
            base_dir: base_dir.into(),
            config: config.clone(),
            run_options,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn run_options(&self) -> RunOptions {
        self.run_options
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Directory this job maps to, computed without touching the disk.
    pub fn job_dir(&self) -> PathBuf {
        job_dir_for(&self.base_dir, &self.config)
    }

    /// Creates the job directory and persisted config if needed, checking
    /// an existing one for identity conflicts.
    pub fn resolve(&self) -> Result<PathBuf, IdentityError> {
        resolve(&self.base_dir, &self.config)
    }

    /// Copy of this job with different run options; the identity is unchanged.
    pub fn with_run_options(&self, run_options: RunOptions) -> Self {
        Self {
            run_options,
            ..self.clone()
        }
    }
}
