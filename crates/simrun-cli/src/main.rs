use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use simrun_core::JobDescriptor;
use simrun_runner::{
    default_workers, dispatch, job_status, load_plan, run_build_command, CancellationToken,
    JobReport, JobStatus, Plan, ProcessEngine,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "simrun", version, about = "Resumable simulation job orchestrator")]
struct Cli {
    /// Log at debug level regardless of RUST_LOG.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile every job of a plan against its on-disk state.
    Run {
        plan: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
        /// Engine executable, overriding the plan.
        #[arg(long)]
        engine: Option<PathBuf>,
        /// Delete all run data of every job first.
        #[arg(long)]
        clean: bool,
        /// Re-analyze every run even if its analysis is current.
        #[arg(long)]
        analyze: bool,
        #[arg(long)]
        skip_build: bool,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print the job directory of every job without touching the disk.
    Resolve {
        plan: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show per-job progress.
    Status {
        plan: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok((payload, code)) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            ExitCode::from(code)
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
            } else {
                eprintln!("error: {:#}", err);
            }
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = log_filter(verbose, std::env::var("RUST_LOG").ok().as_deref());
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_thread_names(true))
        .init();
}

/// `--verbose` wins, then `RUST_LOG`, then `info`.
fn log_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn run_command(command: Commands) -> Result<(Option<Value>, u8)> {
    match command {
        Commands::Run {
            plan,
            workers,
            engine,
            clean,
            analyze,
            skip_build,
            set_values,
            json,
        } => {
            let mut plan = open_plan(&plan, &set_values)?;
            if let Some(engine) = engine {
                plan.engine.program = engine;
            }
            let jobs: Vec<JobDescriptor> = plan
                .jobs()?
                .into_iter()
                .map(|job| {
                    let mut options = job.run_options();
                    options.clean |= clean;
                    options.analyze |= analyze;
                    job.with_run_options(options)
                })
                .collect();
            let workers = workers.or(plan.workers).unwrap_or_else(default_workers);

            let cancel = CancellationToken::new();
            cancel
                .install_signal_handlers()
                .context("installing signal handlers")?;
            if !skip_build {
                if let Some(build) = &plan.engine.build {
                    run_build_command(build, &plan.root)?;
                }
            }

            let engine =
                ProcessEngine::new(plan.engine.program.clone()).with_args(plan.engine.args.clone());
            let report = dispatch(&jobs, &engine, &cancel, workers);
            let code = report.decision.exit_code();
            if json {
                return Ok((
                    Some(json!({
                        "ok": code == 0,
                        "command": "run",
                        "decision": report.decision.as_str(),
                        "exit_code": code,
                        "workers": workers,
                        "jobs": report.reports.iter().map(job_report_to_json).collect::<Vec<_>>(),
                    })),
                    code,
                ));
            }
            for job_report in &report.reports {
                print_job_report(job_report);
            }
            println!("decision: {}", report.decision.as_str());
            Ok((None, code))
        }
        Commands::Resolve {
            plan,
            set_values,
            json,
        } => {
            let plan = open_plan(&plan, &set_values)?;
            let jobs = plan.jobs()?;
            if json {
                let entries: Vec<Value> = jobs
                    .iter()
                    .map(|job| {
                        json!({
                            "label": job.label(),
                            "job_dir": job.job_dir().display().to_string(),
                            "run_options": job.run_options(),
                        })
                    })
                    .collect();
                return Ok((
                    Some(json!({"ok": true, "command": "resolve", "jobs": entries})),
                    0,
                ));
            }
            for job in &jobs {
                println!("{}\t{}", job.label().unwrap_or("-"), job.job_dir().display());
            }
            Ok((None, 0))
        }
        Commands::Status {
            plan,
            set_values,
            json,
        } => {
            let plan = open_plan(&plan, &set_values)?;
            let mut entries = Vec::new();
            for job in plan.jobs()? {
                let status = job_status(&job.job_dir())
                    .with_context(|| format!("inspecting {}", job.job_dir().display()))?;
                entries.push((job, status));
            }
            if json {
                let jobs: Vec<Value> = entries
                    .iter()
                    .map(|(job, status)| status_to_json(job, status))
                    .collect();
                return Ok((
                    Some(json!({"ok": true, "command": "status", "jobs": jobs})),
                    0,
                ));
            }
            for (job, status) in &entries {
                print_status(job, status);
            }
            Ok((None, 0))
        }
    }
}

fn open_plan(path: &Path, set_values: &[String]) -> Result<Plan> {
    let mut plan = load_plan(path)?;
    plan.apply_overrides(&parse_set_bindings(set_values)?)?;
    Ok(plan)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Resolve { json, .. }
        | Commands::Status { json, .. } => *json,
    }
}

fn job_report_to_json(report: &JobReport) -> Value {
    json!({
        "label": report.label,
        "job_dir": report.job_dir.display().to_string(),
        "outcome": report.outcome.as_str(),
        "error": report.outcome.error().map(|e| json!({
            "code": e.code(),
            "message": e.to_string(),
        })),
        "summary": report.summary,
    })
}

fn print_job_report(report: &JobReport) {
    println!(
        "{}\t{}\t{}\tinvocations={}",
        report.label.as_deref().unwrap_or("-"),
        report.outcome.as_str(),
        report.job_dir.display(),
        report.summary.invocations()
    );
    if let Some(e) = report.outcome.error() {
        println!("  error[{}]: {}", e.code(), e);
    }
}

fn status_to_json(job: &JobDescriptor, status: &JobStatus) -> Value {
    json!({
        "label": job.label(),
        "satisfied": status.satisfies(job.run_options()),
        "run_options": job.run_options(),
        "status": status,
    })
}

fn print_status(job: &JobDescriptor, status: &JobStatus) {
    let options = job.run_options();
    println!(
        "{}\t{}\truns={}/{}\tshards={}/{}\t{}",
        job.label().unwrap_or("-"),
        status.job_dir.display(),
        status.runs.len(),
        options.n_runs,
        status.total_shards(),
        options.n_runs * options.n_files,
        if status.satisfies(options) {
            "complete"
        } else {
            "pending"
        }
    );
    if let Some(holder) = &status.lock_holder {
        println!("  locked: {}", holder);
    }
    for run in &status.runs {
        println!(
            "  run-{:04}\tshards={}\tcheckpoint={}\tanalysis={}",
            run.run_idx, run.shards, run.checkpoint, run.analysis
        );
    }
}

fn parse_set_bindings(values: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid --set '{}': expected pointer=value", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "invalid --set '{}': pointer cannot be empty",
                raw
            ));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.insert(key.to_string(), parsed);
    }
    Ok(out)
}
