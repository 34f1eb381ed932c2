//! Lifecycle Orchestrator (§4.I): decodes the job payload, validates it,
//! dispatches to the `exec_per_job` or `persistent_http` discipline, and
//! turns the result into the stdout envelope and process exit code.
//!
//! Grounded on `original_source/.../cmd/run_job.go` (decode, dispatch on
//! `interface.kind`) and the teacher's `main.rs` top-level error handling:
//! classified failures always produce a JSON envelope on stdout before the
//! process exits, never a bare stderr message and silent exit.

use anyhow::{Context, Result};
use base64::Engine;
use std::path::Path;
use std::time::Instant;

use crate::dispatch::{exec_per_job, persistent_http, DispatchOutcome};
use crate::platform::PlatformClient;
use crate::types::{AgentEnvelope, InterfaceKind, JobError, JobPayload};

pub fn decode_payload(encoded: &str) -> Result<JobPayload> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("decode base64 job payload")?;
    serde_json::from_slice(&bytes).context("parse job payload JSON")
}

fn validate(payload: &JobPayload) -> Result<(), JobError> {
    if payload.job_id.trim().is_empty() {
        return Err(JobError::new("WORKER_START_ERROR", "job_id is required"));
    }
    if payload.job_class.trim().is_empty() {
        return Err(JobError::new("WORKER_START_ERROR", "job_class is required"));
    }
    if payload.interface.kind == InterfaceKind::ExecPerJob && payload.worker_command.is_empty() {
        return Err(JobError::new(
            "WORKER_START_ERROR",
            "worker_command is required for exec_per_job",
        ));
    }
    Ok(())
}

/// Run one job end-to-end and return the process exit code, having already
/// printed the stdout envelope (§6) as the last line written to stdout.
pub fn run(payload_base64: &str, state_root: &Path, log_root: &Path) -> Result<i32> {
    let invocation_start = Instant::now();

    let payload = match decode_payload(payload_base64) {
        Ok(payload) => payload,
        Err(e) => {
            let envelope = AgentEnvelope {
                success: false,
                job_id: String::new(),
                job_class: String::new(),
                status: None,
                exit_code: None,
                result: None,
                output_files: vec![],
                worker_pid: None,
                timing: Default::default(),
                error: Some(JobError::new("WORKER_START_ERROR", e.to_string())),
            };
            envelope.print();
            return Ok(1);
        }
    };

    if let Err(error) = validate(&payload) {
        crate::paths::ensure_state_dirs(state_root).ok();
        let envelope = AgentEnvelope {
            success: false,
            job_id: payload.job_id.clone(),
            job_class: payload.job_class.clone(),
            status: None,
            exit_code: None,
            result: None,
            output_files: vec![],
            worker_pid: None,
            timing: crate::types::Timing {
                total_time_seconds: invocation_start.elapsed().as_secs_f64(),
                ..Default::default()
            },
            error: Some(error),
        };
        envelope.print();
        return Ok(1);
    }

    crate::paths::ensure_state_dirs(state_root)
        .with_context(|| format!("create state dirs under {}", state_root.display()))?;
    crate::paths::ensure_log_dirs(log_root)
        .with_context(|| format!("create log dirs under {}", log_root.display()))?;

    let platform = payload
        .platform_url
        .as_ref()
        .zip(payload.job_token.as_ref())
        .map(|(url, token)| PlatformClient::new(url.clone(), token.clone()));

    let outcome: DispatchOutcome = match payload.interface.kind {
        InterfaceKind::ExecPerJob => exec_per_job::run(
            &payload,
            state_root,
            log_root,
            invocation_start,
            platform.as_ref(),
        )?,
        InterfaceKind::PersistentHttp => persistent_http::run(
            &payload,
            state_root,
            log_root,
            invocation_start,
            platform.as_ref(),
        )?,
    };

    let status = if outcome.pending_ack {
        Some("pending".to_string())
    } else {
        None
    };

    let envelope = AgentEnvelope {
        success: outcome.success,
        job_id: payload.job_id.clone(),
        job_class: payload.job_class.clone(),
        status,
        exit_code: outcome.exit_code,
        result: outcome.result.clone(),
        output_files: outcome.output_files.clone(),
        worker_pid: outcome.worker_pid,
        timing: outcome.timing.clone(),
        error: outcome.error.clone(),
    };
    envelope.print();

    Ok(outcome.process_exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InterfaceConfig, JobPayload};

    fn encode(payload: &JobPayload) -> String {
        let json = serde_json::to_vec(payload).unwrap();
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    #[test]
    fn empty_job_id_fails_validation_without_touching_dispatch() {
        let tmp = tempfile::tempdir().unwrap();
        let payload = JobPayload {
            job_id: "".into(),
            job_class: "demo".into(),
            worker_command: vec!["/bin/echo".into()],
            interface: InterfaceConfig {
                kind: InterfaceKind::ExecPerJob,
                port: None,
            },
            job_input: serde_json::json!({}),
            wait_for_completion: true,
            job_token: None,
            platform_url: None,
            output_location: None,
        };
        let exit_code = run(&encode(&payload), tmp.path(), tmp.path()).unwrap();
        assert_eq!(exit_code, 1);
    }

    #[test]
    fn malformed_base64_is_a_clean_failure_not_a_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let exit_code = run("not valid base64!!", tmp.path(), tmp.path()).unwrap();
        assert_eq!(exit_code, 1);
    }

    #[test]
    fn happy_path_exec_per_job_succeeds_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let payload = JobPayload {
            job_id: "j1".into(),
            job_class: "demo".into(),
            worker_command: vec!["/bin/echo".into(), "hi".into()],
            interface: InterfaceConfig {
                kind: InterfaceKind::ExecPerJob,
                port: None,
            },
            job_input: serde_json::json!({}),
            wait_for_completion: true,
            job_token: None,
            platform_url: None,
            output_location: None,
        };
        let exit_code = run(&encode(&payload), tmp.path(), tmp.path()).unwrap();
        assert_eq!(exit_code, 0);
    }
}
