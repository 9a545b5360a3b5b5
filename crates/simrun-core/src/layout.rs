//! File names inside a job directory, shared with the engine.
//!
//! The orchestrator never reads artifact contents. Progress is inferred from
//! which entries exist, so these names are part of the engine contract.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

pub const LOCK_FILE_NAME: &str = ".lock";
pub const LOG_FILE_NAME: &str = "output.log";
pub const RUN_DIR_PREFIX: &str = "run-";
pub const SHARD_FILE_PREFIX: &str = "output-";
pub const ARTIFACT_EXTENSION: &str = "msgpack";
pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.msgpack";
pub const ANALYSIS_FILE_NAME: &str = "analysis.msgpack";

pub fn run_dir_name(run_idx: usize) -> String {
    format!("{}{:04}", RUN_DIR_PREFIX, run_idx)
}

pub fn run_dir(job_dir: &Path, run_idx: usize) -> PathBuf {
    job_dir.join(run_dir_name(run_idx))
}

pub fn shard_file_name(shard_idx: usize) -> String {
    format!("{}{:04}.{}", SHARD_FILE_PREFIX, shard_idx, ARTIFACT_EXTENSION)
}

fn children(dir: &Path) -> io::Result<Vec<walkdir::DirEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        out.push(entry.map_err(io::Error::from)?);
    }
    Ok(out)
}

fn name_starts_with(entry: &walkdir::DirEntry, prefix: &str) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with(prefix))
        .unwrap_or(false)
}

/// Number of `run-*` directories directly under `job_dir`.
pub fn count_runs(job_dir: &Path) -> io::Result<usize> {
    Ok(children(job_dir)?
        .iter()
        .filter(|e| e.file_type().is_dir() && name_starts_with(e, RUN_DIR_PREFIX))
        .count())
}

/// Number of `output-*` shard files in `run_dir`. Zero when the run does
/// not exist yet.
pub fn count_shards(run_dir: &Path) -> io::Result<usize> {
    Ok(shard_entries(run_dir)?.len())
}

fn shard_entries(run_dir: &Path) -> io::Result<Vec<walkdir::DirEntry>> {
    Ok(children(run_dir)?
        .into_iter()
        .filter(|e| e.file_type().is_file() && name_starts_with(e, SHARD_FILE_PREFIX))
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisState {
    Missing,
    /// Some shard was written after the analysis artifact.
    Stale,
    Current,
}

impl AnalysisState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisState::Missing => "missing",
            AnalysisState::Stale => "stale",
            AnalysisState::Current => "current",
        }
    }

    pub fn needs_analysis(&self) -> bool {
        !matches!(self, AnalysisState::Current)
    }
}

pub fn analysis_state(run_dir: &Path) -> io::Result<AnalysisState> {
    let analyzed_at = match fs::metadata(run_dir.join(ANALYSIS_FILE_NAME)) {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(AnalysisState::Missing),
        Err(e) => return Err(e),
    };
    let newest_shard = shard_entries(run_dir)?
        .iter()
        .filter_map(|e| e.metadata().ok())
        .filter_map(|m| m.modified().ok())
        .max()
        .unwrap_or(SystemTime::UNIX_EPOCH);
    if newest_shard > analyzed_at {
        Ok(AnalysisState::Stale)
    } else {
        Ok(AnalysisState::Current)
    }
}
