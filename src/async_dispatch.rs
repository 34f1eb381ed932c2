//! Async dispatch (§4.H): when `wait_for_completion` is `false`, re-exec
//! `run-job` as a detached child with the flag flipped to `true`, and
//! return an immediate pending acknowledgment without blocking on the
//! job's actual completion.
//!
//! Grounded on the teacher's re-exec pattern (`main.rs`'s
//! `std::env::current_exe()` + detached `Command::spawn()` used for its own
//! background-dispatch mode) and on `original_source/.../cmd/run_job.go`'s
//! `--async` handling.

use anyhow::{Context, Result};
use base64::Engine;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Instant;

use crate::dispatch::DispatchOutcome;
use crate::paths;
use crate::types::{JobPayload, Timing};

/// Encode a payload the same way `run-job` decodes its positional argument.
pub fn encode_payload(payload: &JobPayload) -> Result<String> {
    let json = serde_json::to_vec(payload)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}

pub fn decode_payload(encoded: &str) -> Result<JobPayload> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("decode base64 job payload")?;
    serde_json::from_slice(&bytes).context("parse job payload JSON")
}

/// Re-exec `run-job` with `wait_for_completion=true`, detached from this
/// process's stdio, and return the pending-acknowledgment outcome (§6
/// "pending acknowledgment envelope").
pub fn dispatch(
    payload: &JobPayload,
    state_root: &Path,
    log_root: &Path,
    invocation_start: Instant,
) -> Result<DispatchOutcome> {
    let mut detached_payload = payload.clone();
    detached_payload.wait_for_completion = true;
    let encoded = encode_payload(&detached_payload)?;

    paths::ensure_log_dirs(log_root)?;
    let agent_log = paths::agent_log_path(log_root);
    let stdout_sink = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&agent_log)
        .with_context(|| format!("open agent log {}", agent_log.display()))?;
    let stderr_sink = stdout_sink
        .try_clone()
        .context("cloning agent log handle for stderr")?;

    let exe = std::env::current_exe().context("resolving current executable for re-exec")?;
    let mut command = Command::new(exe);
    command
        .arg("run-job")
        .arg("--root")
        .arg(state_root)
        .arg("--log-root")
        .arg(log_root)
        .arg("--payload-base64")
        .arg(encoded)
        .stdin(Stdio::null())
        .stdout(stdout_sink)
        .stderr(stderr_sink);

    let child = command
        .spawn()
        .context("WORKER_START_ERROR: failed to re-exec detached run-job")?;
    // Detach: the supervisor-less detached child is reaped by the active
    // reaper (§4.A) if `start` installed one, or by its own parent at
    // process exit otherwise. We deliberately do not wait on it here.
    drop(child);

    Ok(DispatchOutcome {
        success: true,
        exit_code: None,
        result: None,
        output_files: vec![],
        timing: Timing {
            total_time_seconds: invocation_start.elapsed().as_secs_f64(),
            ..Default::default()
        },
        error: None,
        worker_pid: None,
        pending_ack: true,
        completion_signal_failed: false,
    })
}
