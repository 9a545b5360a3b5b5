//! Experiment plans: a base configuration plus parameter-sweep variants,
//! each becoming one job.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use simrun_core::{JobDescriptor, RunOptions};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSpec {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Command run once before any job, e.g. `[cargo, build, --release]`.
    #[serde(default)]
    pub build: Option<Vec<String>>,
}

/// Partial [`RunOptions`]; unset fields inherit from the plan.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunOptionsPatch {
    pub n_runs: Option<usize>,
    pub n_files: Option<usize>,
    pub clean: Option<bool>,
    pub analyze: Option<bool>,
}

impl RunOptionsPatch {
    pub fn apply(&self, base: RunOptions) -> RunOptions {
        RunOptions {
            n_runs: self.n_runs.unwrap_or(base.n_runs),
            n_files: self.n_files.unwrap_or(base.n_files),
            clean: self.clean.unwrap_or(base.clean),
            analyze: self.analyze.unwrap_or(base.analyze),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Variant {
    pub name: String,
    /// JSON pointer → replacement value, applied to a copy of the base config.
    #[serde(default)]
    pub set: BTreeMap<String, Value>,
    #[serde(default)]
    pub run_options: Option<RunOptionsPatch>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub base_dir: PathBuf,
    #[serde(default)]
    pub workers: Option<usize>,
    pub engine: EngineSpec,
    pub run_options: RunOptions,
    #[serde(default = "default_include_base")]
    pub include_base: bool,
    pub config: Value,
    #[serde(default)]
    pub variants: Vec<Variant>,
    /// Directory the plan was loaded from; relative paths resolve here.
    #[serde(skip)]
    pub root: PathBuf,
}

fn default_include_base() -> bool {
    true
}

pub fn load_plan(path: &Path) -> Result<Plan> {
    let raw_yaml =
        fs::read_to_string(path).with_context(|| format!("reading plan {}", path.display()))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)
        .with_context(|| format!("parsing plan {}", path.display()))?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    let mut plan: Plan = serde_json::from_value(json_value)
        .with_context(|| format!("invalid plan {}", path.display()))?;

    let root = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    if plan.base_dir.is_relative() {
        plan.base_dir = root.join(&plan.base_dir);
    }
    if plan.engine.program.is_relative() && plan.engine.program.components().count() > 1 {
        plan.engine.program = root.join(&plan.engine.program);
    }
    plan.root = root;
    Ok(plan)
}

impl Plan {
    /// Expands the plan into jobs: the base configuration (unless excluded)
    /// followed by one job per variant.
    ///
    /// Variants that end up with the same configuration as an earlier job
    /// would share its directory, so only the first is kept.
    pub fn jobs(&self) -> Result<Vec<JobDescriptor>> {
        let mut jobs = Vec::new();
        let mut seen = BTreeSet::new();
        let mut push = |job: JobDescriptor, jobs: &mut Vec<JobDescriptor>| {
            let job_dir = job.job_dir();
            if seen.insert(job_dir.clone()) {
                jobs.push(job);
            } else {
                warn!(
                    label = job.label(),
                    job_dir = %job_dir.display(),
                    "variant duplicates an earlier job; skipping"
                );
            }
        };

        if self.include_base {
            push(
                JobDescriptor::new(&self.base_dir, &self.config, self.run_options).with_label("base"),
                &mut jobs,
            );
        }
        for variant in &self.variants {
            let mut config = self.config.clone();
            for (pointer, value) in &variant.set {
                set_json_pointer_value(&mut config, pointer, value.clone())
                    .with_context(|| format!("variant '{}'", variant.name))?;
            }
            let run_options = variant
                .run_options
                .map(|patch| patch.apply(self.run_options))
                .unwrap_or(self.run_options);
            push(
                JobDescriptor::new(&self.base_dir, &config, run_options)
                    .with_label(variant.name.clone()),
                &mut jobs,
            );
        }
        Ok(jobs)
    }

    /// Applies `--set pointer=value` style overrides to the base config.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, Value>) -> Result<()> {
        for (pointer, value) in overrides {
            set_json_pointer_value(&mut self.config, pointer, value.clone())?;
        }
        Ok(())
    }
}

fn decode_pointer_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Sets the value at an RFC 6901 pointer, creating missing object members
/// along the way. Array indices must already exist.
pub fn set_json_pointer_value(root: &mut Value, pointer: &str, new_value: Value) -> Result<()> {
    if pointer.is_empty() {
        *root = new_value;
        return Ok(());
    }
    if !pointer.starts_with('/') {
        return Err(anyhow!("json_pointer must start with '/': {}", pointer));
    }

    let tokens: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(decode_pointer_token)
        .collect();
    let Some((last, parents)) = tokens.split_last() else {
        *root = new_value;
        return Ok(());
    };

    let mut cur = root;
    for token in parents {
        cur = match cur {
            Value::Object(map) => map.entry(token.clone()).or_insert_with(|| json!({})),
            Value::Array(arr) => {
                let idx = array_index(token, arr.len(), pointer)?;
                &mut arr[idx]
            }
            _ => {
                return Err(anyhow!(
                    "json_pointer traversal hit non-container at token '{}' in {}",
                    token,
                    pointer
                ));
            }
        };
    }

    match cur {
        Value::Object(map) => {
            map.insert(last.clone(), new_value);
            Ok(())
        }
        Value::Array(arr) => {
            let idx = array_index(last, arr.len(), pointer)?;
            arr[idx] = new_value;
            Ok(())
        }
        _ => Err(anyhow!(
            "json_pointer target is not an object/array for {}",
            pointer
        )),
    }
}

fn array_index(token: &str, len: usize, pointer: &str) -> Result<usize> {
    let idx: usize = token.parse().map_err(|_| {
        anyhow!(
            "json_pointer token '{}' is not a valid array index in {}",
            token,
            pointer
        )
    })?;
    if idx >= len {
        return Err(anyhow!(
            "json_pointer array index {} out of bounds in {}",
            idx,
            pointer
        ));
    }
    Ok(idx)
}
