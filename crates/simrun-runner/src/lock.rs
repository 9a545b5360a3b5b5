use crate::error::OrchestrationError;
use chrono::Utc;
use fs2::FileExt;
use simrun_core::layout::LOCK_FILE_NAME;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on `<job_dir>/.lock`, held for one reconciliation.
///
/// Acquisition never waits. While held, the file records the holder's pid
/// and acquisition time; the payload is cleared again on release.
#[derive(Debug)]
pub struct JobLock {
    file: File,
    path: PathBuf,
}

impl JobLock {
    pub fn try_acquire(job_dir: &Path) -> Result<Self, OrchestrationError> {
        let path = job_dir.join(LOCK_FILE_NAME);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if is_contended(&e) {
                return Err(OrchestrationError::LockContention { path });
            }
            return Err(e.into());
        }
        let payload = format!(
            "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        file.set_len(0)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Reports whether some process currently holds the job lock, testing it with
/// a shared lock that is released again immediately.
///
/// The returned text is the holder's recorded payload, or a placeholder when
/// the holder has not written it yet. A payload left behind by a holder that
/// died without releasing is ignored.
pub(crate) fn current_holder(job_dir: &Path) -> io::Result<Option<String>> {
    let path = job_dir.join(LOCK_FILE_NAME);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    match FileExt::try_lock_shared(&file) {
        Ok(()) => {
            FileExt::unlock(&file)?;
            Ok(None)
        }
        Err(e) if is_contended(&e) => {
            let text = fs::read_to_string(&path).unwrap_or_default();
            let text = text.trim();
            if text.is_empty() {
                Ok(Some("held".to_string()))
            } else {
                Ok(Some(text.to_string()))
            }
        }
        Err(e) => Err(e),
    }
}
