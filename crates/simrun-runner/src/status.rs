use crate::lock::current_holder;
use serde::Serialize;
use simrun_core::layout::CHECKPOINT_FILE_NAME;
use simrun_core::{analysis_state, count_runs, count_shards, run_dir, RunOptions, CONFIG_FILE_NAME};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub run_idx: usize,
    pub shards: usize,
    pub checkpoint: bool,
    pub analysis: &'static str,
}

/// Snapshot of a job directory, read without writing anything. The job lock
/// is only tested, never held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub job_dir: PathBuf,
    pub exists: bool,
    pub config_persisted: bool,
    /// Payload of the process holding the job lock right now.
    pub lock_holder: Option<String>,
    pub runs: Vec<RunStatus>,
}

impl JobStatus {
    /// Whether reconciling with `options` would issue no engine calls,
    /// ignoring the `clean` and `analyze` overrides.
    pub fn satisfies(&self, options: RunOptions) -> bool {
        self.runs.len() >= options.n_runs
            && self
                .runs
                .iter()
                .take(options.n_runs)
                .all(|run| run.shards >= options.n_files && run.analysis == "current")
    }

    pub fn total_shards(&self) -> usize {
        self.runs.iter().map(|r| r.shards).sum()
    }
}

pub fn job_status(job_dir: &Path) -> io::Result<JobStatus> {
    let exists = job_dir.is_dir();
    let mut runs = Vec::new();
    if exists {
        for run_idx in 0..count_runs(job_dir)? {
            let run = run_dir(job_dir, run_idx);
            runs.push(RunStatus {
                run_idx,
                shards: count_shards(&run)?,
                checkpoint: run.join(CHECKPOINT_FILE_NAME).is_file(),
                analysis: analysis_state(&run)?.as_str(),
            });
        }
    }
    Ok(JobStatus {
        job_dir: job_dir.to_path_buf(),
        exists,
        config_persisted: job_dir.join(CONFIG_FILE_NAME).is_file(),
        lock_holder: current_holder(job_dir)?,
        runs,
    })
}
