use crate::cancel::CancellationToken;
use crate::error::OrchestrationError;
use chrono::Utc;
use simrun_core::layout::LOG_FILE_NAME;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// One engine verb together with its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Create,
    Resume { run_idx: usize },
    Analyze { run_idx: usize },
    Clean,
}

impl EngineCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            EngineCommand::Create => "create",
            EngineCommand::Resume { .. } => "resume",
            EngineCommand::Analyze { .. } => "analyze",
            EngineCommand::Clean => "clean",
        }
    }

    pub fn run_idx(&self) -> Option<usize> {
        match self {
            EngineCommand::Resume { run_idx } | EngineCommand::Analyze { run_idx } => {
                Some(*run_idx)
            }
            EngineCommand::Create | EngineCommand::Clean => None,
        }
    }

    /// Arguments after `--sim-dir <path>`.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(run_idx) = self.run_idx() {
            args.push("--run-idx".to_string());
            args.push(run_idx.to_string());
        }
        args.push(self.verb().to_string());
        args
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine `{verb}` failed with {}", exit_label(exit_code))]
    Failed {
        verb: &'static str,
        run_idx: Option<usize>,
        exit_code: Option<i32>,
    },
    #[error("failed to launch engine {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot write engine log {}: {source}", path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("build command `{command}` failed with {}", exit_label(exit_code))]
    Build {
        command: String,
        exit_code: Option<i32>,
    },
}

/// Something that can apply one engine command to a job directory.
///
/// Implementations run the command to completion before returning.
pub trait Engine: Send + Sync {
    fn execute(&self, job_dir: &Path, command: EngineCommand) -> Result<(), EngineError>;
}

/// Runs the engine executable as a child process:
/// `<program> [args...] --sim-dir <job_dir> [--run-idx <n>] <verb>`.
///
/// Combined stdout and stderr of every invocation are appended to the job's
/// `output.log`, each preceded by a header line.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: PathBuf,
    prefix_args: Vec<String>,
}

impl ProcessEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.prefix_args = args;
        self
    }

    fn command_line(&self, job_dir: &Path, command: EngineCommand) -> Vec<String> {
        let mut parts = vec![self.program.to_string_lossy().to_string()];
        parts.extend(self.prefix_args.iter().cloned());
        parts.push("--sim-dir".to_string());
        parts.push(job_dir.to_string_lossy().to_string());
        parts.extend(command.args());
        parts
    }
}

impl Engine for ProcessEngine {
    fn execute(&self, job_dir: &Path, command: EngineCommand) -> Result<(), EngineError> {
        let log_path = job_dir.join(LOG_FILE_NAME);
        let log_err = |source: io::Error| EngineError::Log {
            path: log_path.clone(),
            source,
        };
        let mut log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(log_err)?;
        let parts = self.command_line(job_dir, command);
        writeln!(
            log,
            "==> {} {}",
            Utc::now().to_rfc3339(),
            shell_join(&parts)
        )
        .map_err(log_err)?;
        let stderr = log.try_clone().map_err(log_err)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&parts[1..]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(stderr));

        let status = cmd
            .spawn()
            .and_then(|mut child| child.wait())
            .map_err(|source| EngineError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(EngineError::Failed {
                verb: command.verb(),
                run_idx: command.run_idx(),
                exit_code: status.code(),
            })
        }
    }
}

/// Gate in front of an [`Engine`] that refuses to start new invocations
/// once the cancellation token is set.
pub struct Invoker<'a> {
    engine: &'a dyn Engine,
    cancel: &'a CancellationToken,
}

impl<'a> Invoker<'a> {
    pub fn new(engine: &'a dyn Engine, cancel: &'a CancellationToken) -> Self {
        Self { engine, cancel }
    }

    pub fn invoke(&self, job_dir: &Path, command: EngineCommand) -> Result<(), OrchestrationError> {
        if self.cancel.is_cancelled() {
            info!(
                verb = command.verb(),
                run_idx = command.run_idx(),
                "stop requested, not starting engine"
            );
            return Err(OrchestrationError::Cancelled);
        }
        debug!(verb = command.verb(), run_idx = command.run_idx(), "invoking engine");
        let started = Instant::now();
        let result = self.engine.execute(job_dir, command);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => debug!(verb = command.verb(), elapsed_ms, "engine finished"),
            Err(e) => warn!(verb = command.verb(), elapsed_ms, error = %e, "engine failed"),
        }
        result.map_err(OrchestrationError::from)
    }
}

/// Runs a one-off build step (e.g. compiling the engine) before any job is
/// dispatched. Output is captured and only surfaced on failure.
pub fn run_build_command(argv: &[String], cwd: &Path) -> Result<(), EngineError> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    let command = shell_join(argv);
    info!(%command, "building engine");
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| EngineError::Spawn {
            program: PathBuf::from(program),
            source,
        })?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines().rev().take(20).collect::<Vec<_>>().into_iter().rev() {
        warn!(target: "simrun::build", "{}", line);
    }
    Err(EngineError::Build {
        command,
        exit_code: output.status.code(),
    })
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
