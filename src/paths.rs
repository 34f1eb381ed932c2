//! State/log root resolution and on-disk layout (§6 "On-disk layout").
//!
//! Root resolution generalizes the teacher's `jobstore::resolve_root`
//! priority chain: CLI flag, then environment variable, then an XDG-style
//! data directory, then a fixed fallback mirroring
//! `internal/config/paths.go`'s `/var/lib` and `/var/log` defaults.

use directories::BaseDirs;
use std::path::{Path, PathBuf};

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_STATE_ROOT: &str = "/var/lib/worker-agent";
const DEFAULT_LOG_ROOT: &str = "/var/log/worker-agent";

/// Resolve the state root following the priority chain.
pub fn resolve_state_root(cli_root: Option<&str>) -> PathBuf {
    resolve_root(cli_root, "AGENT_STATE_ROOT", "state", DEFAULT_STATE_ROOT)
}

/// Resolve the log root following the priority chain.
pub fn resolve_log_root(cli_root: Option<&str>) -> PathBuf {
    resolve_root(cli_root, "AGENT_LOG_ROOT", "logs", DEFAULT_LOG_ROOT)
}

fn resolve_root(cli_root: Option<&str>, env_var: &str, leaf: &str, fixed_fallback: &str) -> PathBuf {
    if let Some(root) = cli_root {
        return PathBuf::from(root);
    }
    if let Ok(root) = std::env::var(env_var) {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("worker-agent").join(leaf);
        }
    }
    if let Some(base_dirs) = BaseDirs::new() {
        let base = base_dirs.home_dir().join(".local").join("share");
        return base.join("worker-agent").join(leaf);
    }
    PathBuf::from(fixed_fallback)
}

/// Worker key: the canonical filesystem-safe identifier for a persistent
/// worker, `http_<port>` (§3 "Worker key").
pub fn worker_key(port: u16) -> String {
    format!("http_{port}")
}

// ---------- state root layout ----------

pub fn job_state_path(state_root: &Path, job_id: &str) -> PathBuf {
    state_root.join("jobs").join(format!("{job_id}.json"))
}

pub fn job_result_path(state_root: &Path, job_id: &str) -> PathBuf {
    state_root.join("jobs").join(format!("{job_id}.result.json"))
}

pub fn job_dir(state_root: &Path, job_id: &str) -> PathBuf {
    state_root.join("jobs").join(job_id)
}

pub fn job_output_dir(state_root: &Path, job_id: &str) -> PathBuf {
    job_dir(state_root, job_id).join("output")
}

/// Path the worker is told (via `JOB_RESULT_FILE`) to drop its final JSON
/// result at, for `exec_per_job` (§4.F step 5).
pub fn job_result_file_path(state_root: &Path, job_id: &str) -> PathBuf {
    job_dir(state_root, job_id).join("job_result_file.json")
}

pub fn job_manifest_path(state_root: &Path, job_id: &str) -> PathBuf {
    job_output_dir(state_root, job_id).join("__manifest__.json")
}

pub fn worker_state_path(state_root: &Path, worker_key: &str) -> PathBuf {
    state_root.join("workers").join(format!("{worker_key}.json"))
}

pub fn worker_start_lock_path(state_root: &Path, worker_key: &str) -> PathBuf {
    state_root
        .join("workers")
        .join(format!("{worker_key}.start.lock"))
}

pub fn worker_jobs_index_dir(state_root: &Path, worker_key: &str) -> PathBuf {
    state_root.join("workers-jobs").join(worker_key)
}

pub fn worker_jobs_index_entry(state_root: &Path, worker_key: &str, job_id: &str) -> PathBuf {
    worker_jobs_index_dir(state_root, worker_key).join(format!("{job_id}.json"))
}

// ---------- log root layout ----------

pub fn agent_log_path(log_root: &Path) -> PathBuf {
    log_root.join("agent.log")
}

pub fn unified_log_path(log_root: &Path) -> PathBuf {
    log_root.join("unified.log")
}

pub fn job_log_path(log_root: &Path, job_id: &str) -> PathBuf {
    log_root.join("jobs").join(format!("{job_id}.log"))
}

pub fn worker_log_path(log_root: &Path, worker_key: &str) -> PathBuf {
    log_root.join("workers").join(format!("{worker_key}.log"))
}

pub fn ensure_state_dirs(state_root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(state_root.join("jobs"))?;
    std::fs::create_dir_all(state_root.join("workers"))?;
    std::fs::create_dir_all(state_root.join("workers-jobs"))?;
    Ok(())
}

pub fn ensure_log_dirs(log_root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(log_root.join("jobs"))?;
    std::fs::create_dir_all(log_root.join("workers"))?;
    Ok(())
}
