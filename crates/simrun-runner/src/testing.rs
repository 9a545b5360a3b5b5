//! In-process stand-in for the simulation engine.

use crate::cancel::CancellationToken;
use crate::engine::{Engine, EngineCommand, EngineError};
use simrun_core::layout::{
    run_dir, shard_file_name, ANALYSIS_FILE_NAME, CHECKPOINT_FILE_NAME, RUN_DIR_PREFIX,
};
use simrun_core::{count_runs, count_shards};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Mutates a job directory the way the real engine would and records every
/// command it receives.
#[derive(Default)]
pub struct FakeEngine {
    calls: Mutex<Vec<(PathBuf, EngineCommand)>>,
    fail_on: Mutex<Option<(EngineCommand, i32)>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl FakeEngine {
    /// Makes `command` exit with `code` instead of doing its work.
    pub fn fail_on(self, command: EngineCommand, code: i32) -> Self {
        *self.fail_on.lock().unwrap() = Some((command, code));
        self
    }

    /// Sets `token` once `calls` invocations have completed.
    pub fn cancel_after(self, calls: usize, token: &CancellationToken) -> Self {
        *self.cancel_after.lock().unwrap() = Some((calls, token.clone()));
        self
    }

    pub fn invocations(&self) -> Vec<EngineCommand> {
        self.calls.lock().unwrap().iter().map(|(_, c)| *c).collect()
    }

    pub fn invocations_for(&self, job_dir: &Path) -> Vec<EngineCommand> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(dir, _)| dir == job_dir)
            .map(|(_, c)| *c)
            .collect()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.invocations().iter().filter(|c| c.verb() == verb).count()
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn apply(&self, job_dir: &Path, command: EngineCommand) -> std::io::Result<bool> {
        match command {
            EngineCommand::Create => {
                let run = run_dir(job_dir, count_runs(job_dir)?);
                fs::create_dir_all(&run)?;
                fs::write(run.join(CHECKPOINT_FILE_NAME), b"state-0")?;
            }
            EngineCommand::Resume { run_idx } => {
                let run = run_dir(job_dir, run_idx);
                if !run.join(CHECKPOINT_FILE_NAME).exists() {
                    return Ok(false);
                }
                let next = count_shards(&run)?;
                fs::write(run.join(shard_file_name(next)), b"shard")?;
                fs::write(run.join(CHECKPOINT_FILE_NAME), format!("state-{}", next + 1))?;
            }
            EngineCommand::Analyze { run_idx } => {
                let run = run_dir(job_dir, run_idx);
                if !run.exists() {
                    return Ok(false);
                }
                fs::write(run.join(ANALYSIS_FILE_NAME), b"stats")?;
            }
            EngineCommand::Clean => {
                for entry in fs::read_dir(job_dir)? {
                    let entry = entry?;
                    if entry.file_name().to_string_lossy().starts_with(RUN_DIR_PREFIX) {
                        fs::remove_dir_all(entry.path())?;
                    }
                }
            }
        }
        Ok(true)
    }
}

impl Engine for FakeEngine {
    fn execute(&self, job_dir: &Path, command: EngineCommand) -> Result<(), EngineError> {
        let calls = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((job_dir.to_path_buf(), command));
            calls.len()
        };
        let failure = *self.fail_on.lock().unwrap();
        let result = match failure {
            Some((target, code)) if target == command => Err(code),
            _ => match self.apply(job_dir, command) {
                Ok(true) => Ok(()),
                Ok(false) | Err(_) => Err(1),
            },
        };
        if let Some((after, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if calls >= *after {
                token.cancel();
            }
        }
        result.map_err(|code| EngineError::Failed {
            verb: command.verb(),
            run_idx: command.run_idx(),
            exit_code: Some(code),
        })
    }
}
