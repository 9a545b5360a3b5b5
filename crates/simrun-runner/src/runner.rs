use crate::cancel::CancellationToken;
use crate::engine::{Engine, Invoker};
use crate::error::OrchestrationError;
use crate::lock::JobLock;
use crate::reconcile::{reconcile_into, ReconcileSummary};
use simrun_core::JobDescriptor;
use std::path::PathBuf;
use tracing::{error, info, info_span, warn};

#[derive(Debug)]
pub enum JobOutcome {
    Finished,
    /// Cancellation was observed before the job reached its target.
    Stopped,
    Failed(OrchestrationError),
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Finished => "finished",
            JobOutcome::Stopped => "stopped",
            JobOutcome::Failed(_) => "failed",
        }
    }

    pub fn from_result<T>(result: Result<T, OrchestrationError>) -> Self {
        match result {
            Ok(_) => JobOutcome::Finished,
            Err(OrchestrationError::Cancelled) => JobOutcome::Stopped,
            Err(e) => JobOutcome::Failed(e),
        }
    }

    pub fn error(&self) -> Option<&OrchestrationError> {
        match self {
            JobOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct JobReport {
    pub label: Option<String>,
    pub job_dir: PathBuf,
    pub outcome: JobOutcome,
    pub summary: ReconcileSummary,
}

impl JobReport {
    pub(crate) fn without_work(job: &JobDescriptor, outcome: JobOutcome) -> Self {
        Self {
            label: job.label().map(str::to_string),
            job_dir: job.job_dir(),
            outcome,
            summary: ReconcileSummary::default(),
        }
    }
}

/// Reconciles one job under its directory lock and classifies the result.
///
/// Never returns an error: every failure is folded into the report's
/// outcome so sibling jobs keep running.
pub fn run_job(job: &JobDescriptor, engine: &dyn Engine, cancel: &CancellationToken) -> JobReport {
    let job_dir = job.job_dir();
    let hash = job_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let span = info_span!("job", id = %&hash[..hash.len().min(12)], label = job.label());
    let _enter = span.enter();

    info!(job_dir = %job_dir.display(), options = ?job.run_options(), "starting job");
    let mut summary = ReconcileSummary::default();
    let result = execute(job, engine, cancel, &mut summary);
    let outcome = JobOutcome::from_result(result);
    let label = outcome.as_str();
    match &outcome {
        JobOutcome::Finished => {
            info!(outcome = label, invocations = summary.invocations(), "job done")
        }
        JobOutcome::Stopped => {
            warn!(outcome = label, invocations = summary.invocations(), "job done")
        }
        JobOutcome::Failed(e) => {
            error!(outcome = label, code = e.code(), error = %e, "job done")
        }
    }
    JobReport {
        label: job.label().map(str::to_string),
        job_dir,
        outcome,
        summary,
    }
}

fn execute(
    job: &JobDescriptor,
    engine: &dyn Engine,
    cancel: &CancellationToken,
    summary: &mut ReconcileSummary,
) -> Result<(), OrchestrationError> {
    let job_dir = job.resolve()?;
    let _lock = JobLock::try_acquire(&job_dir)?;
    let invoker = Invoker::new(engine, cancel);
    reconcile_into(&job_dir, job.run_options(), &invoker, summary)
}
