//! Reconciles simulation job directories against requested quotas by
//! driving an external engine, one job per worker thread.

mod cancel;
mod engine;
mod error;
mod lock;
mod plan;
mod pool;
mod reconcile;
mod runner;
mod status;
#[cfg(test)]
mod testing;

pub use cancel::CancellationToken;
pub use engine::{run_build_command, Engine, EngineCommand, EngineError, Invoker, ProcessEngine};
pub use error::OrchestrationError;
pub use lock::JobLock;
pub use plan::{load_plan, set_json_pointer_value, EngineSpec, Plan, RunOptionsPatch, Variant};
pub use pool::{default_workers, dispatch, DispatchReport, ExitDecision};
pub use reconcile::{reconcile, ReconcileSummary};
pub use runner::{run_job, JobOutcome, JobReport};
pub use status::{job_status, JobStatus, RunStatus};
