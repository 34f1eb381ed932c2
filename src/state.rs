//! State Store (§4.B): atomic-enough read/write of `JobState`, `JobResult`,
//! `WorkerState`, and the worker→jobs symlink index.
//!
//! Grounded on the teacher's `jobstore.rs` (`read_state`/`write_state`
//! pair, directory creation on write) and on
//! `internal/state/job.go`/`worker.go`: a missing file is `Ok(None)`, never
//! an error, and writes are a plain overwrite because exactly one process
//! owns a given key at a time (§3 "Ownership").

use anyhow::{Context, Result};
use std::path::Path;

use crate::paths;
use crate::types::{JobResult, JobState, WorkerState};

/// Read `JobState` for `job_id`. Missing file → `Ok(None)`.
pub fn read_job_state(state_root: &Path, job_id: &str) -> Result<Option<JobState>> {
    read_json(&paths::job_state_path(state_root, job_id))
}

/// Write `JobState`, creating parent directories as needed.
///
/// `spec.md` §4.B permits a plain overwrite here (write-to-temp-then-rename
/// is noted as a nice-to-have, not required, given the single-writer
/// invariant); we keep the teacher's direct-write style.
pub fn write_job_state(state_root: &Path, state: &JobState) -> Result<()> {
    write_json(&paths::job_state_path(state_root, &state.job_id), state)
}

/// Write `JobState` and ensure the worker→jobs symlink exists (idempotent).
pub fn write_http_job_state(state_root: &Path, state: &JobState, worker_key: &str) -> Result<()> {
    write_job_state(state_root, state)?;
    ensure_worker_job_index_entry(state_root, worker_key, &state.job_id)?;
    Ok(())
}

pub fn read_job_result(state_root: &Path, job_id: &str) -> Result<Option<JobResult>> {
    read_json(&paths::job_result_path(state_root, job_id))
}

pub fn write_job_result(state_root: &Path, result: &JobResult) -> Result<()> {
    write_json(&paths::job_result_path(state_root, &result.job_id), result)
}

pub fn read_worker_state(state_root: &Path, worker_key: &str) -> Result<Option<WorkerState>> {
    read_json(&paths::worker_state_path(state_root, worker_key))
}

pub fn write_worker_state(state_root: &Path, worker_key: &str, state: &WorkerState) -> Result<()> {
    write_json(&paths::worker_state_path(state_root, worker_key), state)
}

/// Ensure `state/workers-jobs/<worker-key>/<job_id>.json` is a symlink to
/// the job-state file. Leaves an existing symlink untouched.
fn ensure_worker_job_index_entry(state_root: &Path, worker_key: &str, job_id: &str) -> Result<()> {
    let index_dir = paths::worker_jobs_index_dir(state_root, worker_key);
    std::fs::create_dir_all(&index_dir)
        .with_context(|| format!("create worker-jobs index dir {}", index_dir.display()))?;

    let entry = paths::worker_jobs_index_entry(state_root, worker_key, job_id);
    if entry.symlink_metadata().is_ok() {
        return Ok(());
    }

    let target = paths::job_state_path(state_root, job_id);
    #[cfg(unix)]
    std::os::unix::fs::symlink(&target, &entry)
        .with_context(|| format!("symlink {} -> {}", entry.display(), target.display()))?;
    #[cfg(not(unix))]
    std::fs::copy(&target, &entry)
        .with_context(|| format!("copy {} -> {}", target.display(), entry.display()))?;

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(raw) => {
            let value = serde_json::from_slice(&raw)
                .with_context(|| format!("parse JSON at {}", path.display()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create parent dir for {}", path.display()))?;
    }
    let contents = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize JSON for {}", path.display()))?;
    std::fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobStatus, WorkerKind};

    #[test]
    fn missing_job_state_is_none_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        let result = read_job_state(tmp.path(), "nonexistent").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn job_state_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let state = JobState::new_pending("j1", "demo", WorkerKind::ExecPerJob);
        write_job_state(tmp.path(), &state).unwrap();
        let back = read_job_state(tmp.path(), "j1").unwrap().unwrap();
        assert_eq!(back.job_id, "j1");
        assert_eq!(back.status, JobStatus::Pending);
    }

    #[test]
    fn http_job_state_creates_symlink_index_once() {
        let tmp = tempfile::tempdir().unwrap();
        let state = JobState::new_pending("j2", "demo", WorkerKind::PersistentHttp);
        write_http_job_state(tmp.path(), &state, "http_9101").unwrap();

        let entry = paths::worker_jobs_index_entry(tmp.path(), "http_9101", "j2");
        assert!(entry.symlink_metadata().is_ok());

        // Calling again must not error or replace the existing entry.
        write_http_job_state(tmp.path(), &state, "http_9101").unwrap();
        assert!(entry.symlink_metadata().is_ok());
    }

    #[test]
    fn job_result_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let result = JobResult {
            success: true,
            job_id: "j1".into(),
            job_class: "demo".into(),
            result: None,
            error: None,
            output_files: vec![],
            timing: Default::default(),
            exit_code: Some(0),
        };
        write_job_result(tmp.path(), &result).unwrap();
        let back = read_job_result(tmp.path(), "j1").unwrap().unwrap();
        assert!(back.success);
        assert_eq!(back.exit_code, Some(0));
    }
}
