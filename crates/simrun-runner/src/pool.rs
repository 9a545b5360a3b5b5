use crate::cancel::CancellationToken;
use crate::engine::Engine;
use crate::error::OrchestrationError;
use crate::runner::{run_job, JobOutcome, JobReport};
use simrun_core::JobDescriptor;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tracing::{error, info, warn};

/// Half the logical CPUs, leaving the rest to the engine processes.
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

/// Process-level verdict over a batch of job outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Success,
    /// Nothing failed but some job stopped early; rerunning continues it.
    Incomplete,
    Failure,
}

impl ExitDecision {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a JobOutcome>) -> Self {
        let mut decision = ExitDecision::Success;
        for outcome in outcomes {
            match outcome {
                JobOutcome::Failed(_) => return ExitDecision::Failure,
                JobOutcome::Stopped => decision = ExitDecision::Incomplete,
                JobOutcome::Finished => {}
            }
        }
        decision
    }

    /// `75` is `EX_TEMPFAIL` from sysexits.h.
    pub fn exit_code(&self) -> u8 {
        match self {
            ExitDecision::Success => 0,
            ExitDecision::Incomplete => 75,
            ExitDecision::Failure => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitDecision::Success => "success",
            ExitDecision::Incomplete => "incomplete",
            ExitDecision::Failure => "failure",
        }
    }
}

#[derive(Debug)]
pub struct DispatchReport {
    /// One report per input job, in input order.
    pub reports: Vec<JobReport>,
    pub decision: ExitDecision,
}

/// Runs every job on a pool of `workers` threads and waits for all of them.
///
/// Each worker takes the next queued job and runs it to completion before
/// taking another. One job failing does not affect the others. Once `cancel`
/// is set, jobs still in the queue are reported as stopped without touching
/// their directories.
pub fn dispatch(
    jobs: &[JobDescriptor],
    engine: &dyn Engine,
    cancel: &CancellationToken,
    workers: usize,
) -> DispatchReport {
    let workers = workers.max(1).min(jobs.len().max(1));
    info!(jobs = jobs.len(), workers, "starting worker pool");

    let (job_tx, job_rx) = crossbeam_channel::unbounded::<usize>();
    for idx in 0..jobs.len() {
        let _ = job_tx.send(idx);
    }
    drop(job_tx);
    let (report_tx, report_rx) = crossbeam_channel::unbounded::<(usize, JobReport)>();

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let job_rx = job_rx.clone();
            let report_tx = report_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("simrun-worker-{}", worker))
                .spawn_scoped(scope, move || {
                    for idx in job_rx.iter() {
                        let job = &jobs[idx];
                        let report = if cancel.is_cancelled() {
                            JobReport::without_work(job, JobOutcome::Stopped)
                        } else {
                            run_isolated(job, engine, cancel)
                        };
                        if report_tx.send((idx, report)).is_err() {
                            break;
                        }
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(worker, error = %e, "failed to spawn worker"),
            }
        }
        drop(report_tx);
        for handle in handles {
            if handle.join().is_err() {
                error!("worker exited early; its unreported jobs are marked failed");
            }
        }
    });

    let mut slots: Vec<Option<JobReport>> = jobs.iter().map(|_| None).collect();
    for (idx, report) in report_rx.try_iter() {
        slots[idx] = Some(report);
    }
    let reports: Vec<JobReport> = slots
        .into_iter()
        .zip(jobs)
        .map(|(slot, job)| {
            slot.unwrap_or_else(|| {
                JobReport::without_work(job, JobOutcome::Failed(OrchestrationError::WorkerLost))
            })
        })
        .collect();

    let decision = ExitDecision::from_outcomes(reports.iter().map(|r| &r.outcome));
    match decision {
        ExitDecision::Success => info!("all jobs finished"),
        ExitDecision::Incomplete => warn!("some job was stopped"),
        ExitDecision::Failure => error!("some job failed"),
    }
    DispatchReport { reports, decision }
}

/// Runs one job, turning a panic into a failed report so the worker can
/// keep taking jobs. The job lock is released during unwinding.
fn run_isolated(
    job: &JobDescriptor,
    engine: &dyn Engine,
    cancel: &CancellationToken,
) -> JobReport {
    match panic::catch_unwind(AssertUnwindSafe(|| run_job(job, engine, cancel))) {
        Ok(report) => report,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!(job_dir = %job.job_dir().display(), panic = %message, "job panicked");
            JobReport::without_work(job, JobOutcome::Failed(OrchestrationError::WorkerLost))
        }
    }
}
