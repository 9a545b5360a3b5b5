//! Content-addressed identity and on-disk layout for simulation jobs.
//!
//! Everything here is synchronous filesystem code with no knowledge of the
//! engine process. The runner crate builds reconciliation on top of it.

pub mod identity;
pub mod job;
pub mod layout;

pub use identity::{
    config_hash, job_dir_for, load_persisted_config, resolve, validate_config, IdentityError,
    CONFIG_FILE_NAME,
};
pub use job::{JobDescriptor, RunOptions};
pub use layout::{analysis_state, count_runs, count_shards, run_dir, AnalysisState};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Serializes `value` with object keys sorted at every depth and no
/// insignificant whitespace.
///
/// Structurally equal values always produce identical bytes, independent of
/// the order keys were inserted in or of serde_json's map feature flags.
/// Numbers use serde_json's shortest round-trip formatting; negative zero is
/// written as `0.0`.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(&canonical_json_bytes(value))
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(Value::from(key.as_str()).to_string().as_bytes());
                out.push(b':');
                write_canonical(item, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Number(n) if n.as_f64() == Some(0.0) && n.is_f64() => {
            out.extend_from_slice(b"0.0");
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

/// Writes through a sibling temp file and renames it into place, so readers
/// never observe a partially written file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}.{}", name, pid, ts, seq));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
