use crate::engine::{EngineCommand, Invoker};
use crate::error::OrchestrationError;
use serde::Serialize;
use simrun_core::{analysis_state, count_runs, count_shards, run_dir, RunOptions};
use std::path::Path;
use tracing::info;

/// Engine work issued by one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub cleaned: bool,
    pub runs_created: usize,
    pub shards_resumed: usize,
    pub runs_analyzed: usize,
}

impl ReconcileSummary {
    pub fn invocations(&self) -> usize {
        usize::from(self.cleaned) + self.runs_created + self.shards_resumed + self.runs_analyzed
    }
}

/// Brings `job_dir` up to `options` with the fewest engine invocations.
///
/// Progress is read back from the directory itself, so a pass that was
/// interrupted (or failed) is continued by the next one instead of
/// repeated. A directory that already satisfies `options` costs no engine
/// calls at all.
pub fn reconcile(
    job_dir: &Path,
    options: RunOptions,
    invoker: &Invoker<'_>,
) -> Result<ReconcileSummary, OrchestrationError> {
    let mut summary = ReconcileSummary::default();
    reconcile_into(job_dir, options, invoker, &mut summary)?;
    Ok(summary)
}

/// Same as [`reconcile`] but leaves partial counts in `summary` on error.
pub(crate) fn reconcile_into(
    job_dir: &Path,
    options: RunOptions,
    invoker: &Invoker<'_>,
    summary: &mut ReconcileSummary,
) -> Result<(), OrchestrationError> {
    if options.clean {
        info!("cleaning all runs");
        invoker.invoke(job_dir, EngineCommand::Clean)?;
        summary.cleaned = true;
    }

    let mut touched = vec![false; options.n_runs];

    let mut n_runs = count_runs(job_dir)?;
    while n_runs < options.n_runs {
        info!(run_idx = n_runs, "creating run");
        invoker.invoke(job_dir, EngineCommand::Create)?;
        touched[n_runs] = true;
        n_runs += 1;
        summary.runs_created += 1;
    }

    for (run_idx, touched) in touched.iter_mut().enumerate() {
        let mut n_files = count_shards(&run_dir(job_dir, run_idx))?;
        while n_files < options.n_files {
            info!(run_idx, file = n_files, "resuming run");
            invoker.invoke(job_dir, EngineCommand::Resume { run_idx })?;
            *touched = true;
            n_files += 1;
            summary.shards_resumed += 1;
        }
    }

    for (run_idx, touched) in touched.into_iter().enumerate() {
        let state = analysis_state(&run_dir(job_dir, run_idx))?;
        if options.analyze || touched || state.needs_analysis() {
            info!(run_idx, analysis = state.as_str(), "analyzing run");
            invoker.invoke(job_dir, EngineCommand::Analyze { run_idx })?;
            summary.runs_analyzed += 1;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::testing::FakeEngine;
    use simrun_core::layout::{shard_file_name, ANALYSIS_FILE_NAME};
    use std::fs;
    use std::time::{Duration, SystemTime};

    fn options(n_runs: usize, n_files: usize) -> RunOptions {
        RunOptions {
            n_runs,
            n_files,
            clean: false,
            analyze: false,
        }
    }

    #[test]
    fn clean_start_issues_exact_work_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = FakeEngine::default();
        let token = CancellationToken::new();
        let invoker = Invoker::new(&engine, &token);

        let summary = reconcile(dir.path(), options(2, 3), &invoker).expect("reconcile");
        assert_eq!(
            summary,
            ReconcileSummary {
                cleaned: false,
                runs_created: 2,
                shards_resumed: 6,
                runs_analyzed: 2
            }
        );

        use EngineCommand::*;
        assert_eq!(
            engine.invocations(),
            vec![
                Create,
                Create,
                Resume { run_idx: 0 },
                Resume { run_idx: 0 },
                Resume { run_idx: 0 },
                Resume { run_idx: 1 },
                Resume { run_idx: 1 },
                Resume { run_idx: 1 },
                Analyze { run_idx: 0 },
                Analyze { run_idx: 1 },
            ]
        );
        for run_idx in 0..2 {
            let run = run_dir(dir.path(), run_idx);
            for shard in 0..3 {
                assert!(run.join(shard_file_name(shard)).is_file());
            }
            assert!(!run.join(shard_file_name(3)).exists());
        }
    }

    #[test]
    fn second_pass_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = FakeEngine::default();
        let token = CancellationToken::new();
        let invoker = Invoker::new(&engine, &token);

        reconcile(dir.path(), options(2, 3), &invoker).expect("first pass");
        engine.reset();
        let summary = reconcile(dir.path(), options(2, 3), &invoker).expect("second pass");
        assert_eq!(summary.invocations(), 0);
        assert!(engine.invocations().is_empty());
    }

    #[test]
    fn raising_n_files_resumes_only_the_difference() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = FakeEngine::default();
        let token = CancellationToken::new();
        let invoker = Invoker::new(&engine, &token);

        reconcile(dir.path(), options(2, 3), &invoker).expect("first pass");
        engine.reset();
        let summary = reconcile(dir.path(), options(2, 5), &invoker).expect("second pass");
        assert_eq!(engine.count("create"), 0);
        assert_eq!(engine.count("resume"), 4);
        assert_eq!(summary.shards_resumed, 4);
        assert_eq!(engine.count("analyze"), 2);
    }

    #[test]
    fn raising_n_runs_only_touches_new_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = FakeEngine::default();
        let token = CancellationToken::new();
        let invoker = Invoker::new(&engine, &token);

        reconcile(dir.path(), options(1, 2), &invoker).expect("first pass");
        engine.reset();
        reconcile(dir.path(), options(2, 2), &invoker).expect("second pass");
        use EngineCommand::*;
        assert_eq!(
            engine.invocations(),
            vec![
                Create,
                Resume { run_idx: 1 },
                Resume { run_idx: 1 },
                Analyze { run_idx: 1 }
            ]
        );
    }

    #[test]
    fn missing_analysis_is_recomputed_without_other_work() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = FakeEngine::default();
        let token = CancellationToken::new();
        let invoker = Invoker::new(&engine, &token);

        reconcile(dir.path(), options(2, 1), &invoker).expect("first pass");
        fs::remove_file(run_dir(dir.path(), 1).join(ANALYSIS_FILE_NAME)).unwrap();
        engine.reset();
        reconcile(dir.path(), options(2, 1), &invoker).expect("second pass");
        assert_eq!(engine.invocations(), vec![EngineCommand::Analyze { run_idx: 1 }]);
    }

    #[test]
    fn stale_analysis_is_recomputed_without_other_work() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = FakeEngine::default();
        let token = CancellationToken::new();
        let invoker = Invoker::new(&engine, &token);

        reconcile(dir.path(), options(2, 2), &invoker).expect("first pass");
        // as if the last pass stopped between the final resume and analyze
        let run = run_dir(dir.path(), 0);
        let now = SystemTime::now();
        fs::File::options()
            .write(true)
            .open(run.join(ANALYSIS_FILE_NAME))
            .unwrap()
            .set_modified(now - Duration::from_secs(120))
            .unwrap();
        fs::File::options()
            .write(true)
            .open(run.join(shard_file_name(1)))
            .unwrap()
            .set_modified(now)
            .unwrap();
        engine.reset();

        let summary = reconcile(dir.path(), options(2, 2), &invoker).expect("second pass");
        assert_eq!(engine.invocations(), vec![EngineCommand::Analyze { run_idx: 0 }]);
        assert_eq!(summary.runs_analyzed, 1);
        assert_eq!(summary.shards_resumed, 0);
    }

    #[test]
    fn forced_analysis_and_clean() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = FakeEngine::default();
        let token = CancellationToken::new();
        let invoker = Invoker::new(&engine, &token);

        reconcile(dir.path(), options(2, 1), &invoker).expect("first pass");
        engine.reset();
        let forced = RunOptions {
            analyze: true,
            ..options(2, 1)
        };
        reconcile(dir.path(), forced, &invoker).expect("forced analysis");
        assert_eq!(engine.invocations().len(), 2);
        assert_eq!(engine.count("analyze"), 2);

        engine.reset();
        let clean = RunOptions {
            clean: true,
            ..options(1, 1)
        };
        let summary = reconcile(dir.path(), clean, &invoker).expect("clean pass");
        assert!(summary.cleaned);
        assert_eq!(engine.invocations()[0], EngineCommand::Clean);
        assert_eq!(summary.runs_created, 1);
        assert_eq!(count_runs(dir.path()).unwrap(), 1);
    }

    #[test]
    fn engine_failure_stops_the_pass_and_next_pass_continues() {
        let dir = tempfile::tempdir().expect("tempdir");
        let failing = FakeEngine::default().fail_on(EngineCommand::Resume { run_idx: 1 }, 7);
        let token = CancellationToken::new();

        let err = reconcile(dir.path(), options(2, 2), &Invoker::new(&failing, &token))
            .expect_err("must fail");
        assert!(matches!(
            err,
            OrchestrationError::Engine(crate::engine::EngineError::Failed {
                exit_code: Some(7),
                ..
            })
        ));
        assert_eq!(failing.count("analyze"), 0);
        assert_eq!(count_shards(&run_dir(dir.path(), 0)).unwrap(), 2);

        let engine = FakeEngine::default();
        reconcile(dir.path(), options(2, 2), &Invoker::new(&engine, &token)).expect("retry");
        use EngineCommand::*;
        assert_eq!(
            engine.invocations(),
            vec![
                Resume { run_idx: 1 },
                Resume { run_idx: 1 },
                Analyze { run_idx: 0 },
                Analyze { run_idx: 1 }
            ]
        );
    }

    #[test]
    fn cancellation_between_invocations_leaves_resumable_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = CancellationToken::new();
        let engine = FakeEngine::default().cancel_after(3, &token);

        let mut summary = ReconcileSummary::default();
        let err = reconcile_into(dir.path(), options(2, 2), &Invoker::new(&engine, &token), &mut summary)
            .expect_err("must stop");
        assert!(matches!(err, OrchestrationError::Cancelled));
        assert_eq!(engine.invocations().len(), 3);
        assert_eq!(summary.runs_created, 2);
        assert_eq!(summary.shards_resumed, 1);

        let fresh = CancellationToken::new();
        let resumed = FakeEngine::default();
        let summary = reconcile(dir.path(), options(2, 2), &Invoker::new(&resumed, &fresh))
            .expect("resume");
        assert_eq!(summary.runs_created, 0);
        assert_eq!(summary.shards_resumed, 3);
        assert_eq!(summary.runs_analyzed, 2);
    }
}
