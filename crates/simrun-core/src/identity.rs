//! Mapping from a configuration value to its job directory.

use crate::{atomic_write_bytes, canonical_json_bytes, canonical_json_digest, ensure_dir};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid config at '{pointer}': {reason}")]
    InvalidConfig { pointer: String, reason: String },
    #[error("config mismatch with {}", path.display())]
    Conflict { path: PathBuf },
    #[error("unreadable persisted config {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Checks that `config` can be persisted as TOML and read back unchanged.
pub fn validate_config(config: &Value) -> Result<(), IdentityError> {
    if !config.is_object() {
        return Err(IdentityError::InvalidConfig {
            pointer: String::new(),
            reason: "top level must be a mapping".to_string(),
        });
    }
    validate_node(config, &mut String::new())
}

fn validate_node(value: &Value, pointer: &mut String) -> Result<(), IdentityError> {
    let invalid = |pointer: &str, reason: &str| IdentityError::InvalidConfig {
        pointer: pointer.to_string(),
        reason: reason.to_string(),
    };
    match value {
        Value::Null => Err(invalid(pointer, "null values cannot be persisted")),
        Value::Number(n) if n.is_u64() && n.as_i64().is_none() => {
            Err(invalid(pointer, "integer exceeds the signed 64-bit range"))
        }
        Value::Object(map) => {
            for (key, item) in map {
                let len = pointer.len();
                pointer.push('/');
                pointer.push_str(&key.replace('~', "~0").replace('/', "~1"));
                validate_node(item, pointer)?;
                pointer.truncate(len);
            }
            Ok(())
        }
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                let len = pointer.len();
                pointer.push('/');
                pointer.push_str(&idx.to_string());
                validate_node(item, pointer)?;
                pointer.truncate(len);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub fn config_hash(config: &Value) -> String {
    canonical_json_digest(config)
}

/// Pure path derivation; touches nothing on disk.
pub fn job_dir_for(base_dir: &Path, config: &Value) -> PathBuf {
    base_dir.join(config_hash(config))
}

pub fn load_persisted_config(job_dir: &Path) -> Result<Option<Value>, IdentityError> {
    let path = job_dir.join(CONFIG_FILE_NAME);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value: Value =
        toml::from_str(&text).map_err(|source| IdentityError::Corrupt { path, source })?;
    Ok(Some(value))
}

/// Resolves the job directory for `config` under `base_dir`, persisting the
/// configuration on first use.
///
/// If the directory already carries a persisted configuration it must be
/// structurally equal to `config`; otherwise [`IdentityError::Conflict`] is
/// returned and nothing on disk is touched. Safe to call concurrently for
/// the same configuration: every writer renames identical bytes into place.
pub fn resolve(base_dir: &Path, config: &Value) -> Result<PathBuf, IdentityError> {
    validate_config(config)?;
    let job_dir = job_dir_for(base_dir, config);
    match load_persisted_config(&job_dir)? {
        Some(persisted) => {
            if canonical_json_bytes(&persisted) != canonical_json_bytes(config) {
                return Err(IdentityError::Conflict {
                    path: job_dir.join(CONFIG_FILE_NAME),
                });
            }
        }
        None => {
            ensure_dir(&job_dir)?;
            let text = toml::to_string_pretty(config)?;
            atomic_write_bytes(&job_dir.join(CONFIG_FILE_NAME), text.as_bytes())?;
        }
    }
    Ok(job_dir)
}
