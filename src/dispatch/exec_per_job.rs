//! Dispatcher — `exec_per_job` (§4.F): spawns a one-shot worker, waits,
//! classifies outcome, writes result, optionally uploads and notifies.
//!
//! Grounded on `original_source/.../internal/runner/exec.go`, adapted to
//! `spec.md`'s own resolution that the initial status is `pending` (the
//! Go source skips straight to `running`) and to `spec.md`'s JobResult
//! schema (the Go inline result map is not copied verbatim).

use anyhow::{Context, Result};
use base64::Engine;
use std::process::{Command, Stdio};
use std::time::Instant;

use crate::dispatch::{cancel, DispatchOutcome};
use crate::logs::{self, DefaultLevel};
use crate::platform::PlatformClient;
use crate::types::{JobError, JobPayload, JobResult, JobState, JobStatus, Timing, WorkerKind};
use crate::{async_dispatch, paths, state, timestamp::now_rfc3339};

pub fn run(
    payload: &JobPayload,
    state_root: &std::path::Path,
    log_root: &std::path::Path,
    invocation_start: Instant,
    platform: Option<&PlatformClient>,
) -> Result<DispatchOutcome> {
    // Step 1: persist initial JobState{pending}.
    let mut job_state = JobState::new_pending(&payload.job_id, &payload.job_class, WorkerKind::ExecPerJob);
    state::write_job_state(state_root, &job_state)?;

    // Step 2: create per-job log file (truncating) and output directory.
    let job_log_path = paths::job_log_path(log_root, &payload.job_id);
    if let Some(parent) = job_log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&job_log_path, b"")?;
    let output_dir = paths::job_output_dir(state_root, &payload.job_id);
    std::fs::create_dir_all(&output_dir)?;

    // Step 3: async delegation.
    if !payload.wait_for_completion {
        return async_dispatch::dispatch(payload, state_root, log_root, invocation_start);
    }

    if payload.worker_command.is_empty() {
        return Ok(fail_job(
            state_root,
            &mut job_state,
            invocation_start,
            "WORKER_START_ERROR",
            "worker_command is empty",
        ));
    }

    // Step 4: construct argv with the base64-encoded job_input appended.
    let job_input_b64 =
        base64::engine::general_purpose::STANDARD.encode(payload.job_input.to_string());
    let mut command = Command::new(&payload.worker_command[0]);
    command.args(&payload.worker_command[1..]).arg(&job_input_b64);

    // Step 5: environment.
    let result_file_path = paths::job_result_file_path(state_root, &payload.job_id);
    command
        .env("JOB_ID", &payload.job_id)
        .env("JOB_OUTPUT_DIR", &output_dir)
        .env("JOB_RESULT_FILE", &result_file_path);

    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return Ok(fail_job(
                state_root,
                &mut job_state,
                invocation_start,
                "WORKER_START_ERROR",
                &format!("failed to spawn worker: {e}"),
            ));
        }
    };
    let worker_pid = child.id();

    // Step 6: attach stdout/stderr to the job's log file.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut log_threads = Vec::new();
    if let Some(stdout) = stdout {
        let path = job_log_path.clone();
        log_threads.push(std::thread::spawn(move || {
            logs::drain_to_job_log(stdout, &path, DefaultLevel::Info);
        }));
    }
    if let Some(stderr) = stderr {
        let path = job_log_path.clone();
        log_threads.push(std::thread::spawn(move || {
            logs::drain_to_job_log(stderr, &path, DefaultLevel::Error);
        }));
    }

    // Step 7: signal job start to the control plane, if configured.
    if let Some(platform) = platform {
        if platform.is_configured() {
            if let Err(e) = platform.signal_start(&payload.job_id) {
                cancel::kill_exec_per_job(&mut child);
                for handle in log_threads {
                    let _ = handle.join();
                }
                return Ok(cancelled_outcome(
                    state_root,
                    &payload.job_id,
                    &payload.job_class,
                    "PLATFORM_START_SIGNAL_ERROR",
                    &e.to_string(),
                    Some(worker_pid),
                ));
            }
        }
    }

    let worker_startup_time_seconds = invocation_start.elapsed().as_secs_f64();

    // Step 8: flip to running.
    job_state.status = JobStatus::Running;
    job_state.started_at = Some(now_rfc3339());
    job_state.worker_pid = Some(worker_pid);
    state::write_job_state(state_root, &job_state)?;

    // Step 9: wait for exit.
    let job_start = Instant::now();
    let exit_status = child.wait().context("waiting for worker process")?;
    let job_execution_time_seconds = job_start.elapsed().as_secs_f64();
    for handle in log_threads {
        let _ = handle.join();
    }
    let exit_code = exit_status.code().unwrap_or(1);

    // Step 10: read and parse JOB_RESULT_FILE.
    let worker_result = std::fs::read(&result_file_path)
        .ok()
        .and_then(|raw| serde_json::from_slice::<serde_json::Value>(&raw).ok());

    let mut success = exit_code == 0;
    let mut error = if success {
        None
    } else {
        Some(JobError::new(
            "WORKER_EXIT_ERROR",
            format!("worker exited with code {exit_code}"),
        ))
    };

    // Step 11: upload, if configured and a manifest is present.
    let mut output_files = Vec::new();
    if let Some(platform) = platform {
        if platform.is_configured() {
            if let Ok(Some(manifest)) = crate::upload::read_manifest(state_root, &payload.job_id) {
                match crate::upload::upload_files(platform, state_root, &payload.job_id, &manifest)
                {
                    Ok(files) => output_files = files,
                    Err(e) => {
                        success = false;
                        error = Some(JobError::new("FILE_UPLOAD_ERROR", e.to_string()));
                    }
                }
            }
        }
    }

    // Step 12: completion notification (best effort).
    let mut completion_signal_failed = false;
    if let Some(platform) = platform {
        if platform.is_configured() {
            let completion = crate::types::CompletionRequest {
                success,
                result: worker_result.clone(),
                error: error.clone(),
                output_files: output_files.clone(),
                exit_code: Some(exit_code),
                timing: Default::default(),
            };
            if let Err(e) = platform.signal_completion(&payload.job_id, &completion) {
                tracing::warn!(error = %e, "completion signal failed");
                completion_signal_failed = true;
            }
        }
    }
    if completion_signal_failed {
        let note = "; completion_signal_failed";
        error = Some(match error {
            Some(mut existing) => {
                existing.message.push_str(note);
                existing
            }
            None => JobError::new("completion_signal_failed", "completion signal failed"),
        });
    }

    let total_time_seconds = invocation_start.elapsed().as_secs_f64();
    let timing = Timing {
        total_time_seconds,
        worker_startup_time_seconds: Some(worker_startup_time_seconds),
        job_execution_time_seconds: Some(job_execution_time_seconds),
        worker_ready_time_seconds: None,
    };

    // Step 13: write JobResult, then terminal JobState (§4.B ordering rule).
    let job_result = JobResult {
        success,
        job_id: payload.job_id.clone(),
        job_class: payload.job_class.clone(),
        result: worker_result,
        error: error.clone(),
        output_files: output_files.clone(),
        timing: timing.clone(),
        exit_code: Some(exit_code),
    };
    state::write_job_result(state_root, &job_result)?;

    job_state.status = if success {
        JobStatus::Success
    } else {
        JobStatus::Failed
    };
    job_state.completed_at = Some(now_rfc3339());
    job_state.error = error.as_ref().map(|e| e.message.clone());
    job_state.meta = Some(crate::types::JobMeta {
        exit_code: Some(exit_code),
        http_status: None,
    });
    state::write_job_state(state_root, &job_state)?;

    Ok(DispatchOutcome {
        success,
        exit_code: Some(exit_code),
        result: job_result.result,
        output_files,
        timing,
        error,
        worker_pid: Some(worker_pid),
        pending_ack: false,
        completion_signal_failed,
    })
}

fn fail_job(
    state_root: &std::path::Path,
    job_state: &mut JobState,
    invocation_start: Instant,
    code: &str,
    message: &str,
) -> DispatchOutcome {
    let error = JobError::new(code, message);
    let job_result = JobResult {
        success: false,
        job_id: job_state.job_id.clone(),
        job_class: job_state.job_class.clone(),
        result: None,
        error: Some(error.clone()),
        output_files: vec![],
        timing: Timing {
            total_time_seconds: invocation_start.elapsed().as_secs_f64(),
            ..Default::default()
        },
        exit_code: None,
    };
    let _ = state::write_job_result(state_root, &job_result);

    job_state.status = JobStatus::Failed;
    job_state.completed_at = Some(now_rfc3339());
    job_state.error = Some(message.to_string());
    let _ = state::write_job_state(state_root, job_state);

    DispatchOutcome {
        success: false,
        exit_code: None,
        result: None,
        output_files: vec![],
        timing: job_result.timing,
        error: Some(error),
        worker_pid: None,
        pending_ack: false,
        completion_signal_failed: false,
    }
}

fn cancelled_outcome(
    state_root: &std::path::Path,
    job_id: &str,
    job_class: &str,
    code: &str,
    message: &str,
    worker_pid: Option<u32>,
) -> DispatchOutcome {
    let job_result = cancel::build_cancelled_result(job_id, job_class, code, message);
    let _ = state::write_job_result(state_root, &job_result);

    if let Ok(Some(mut job_state)) = state::read_job_state(state_root, job_id) {
        job_state.status = JobStatus::Failed;
        job_state.completed_at = Some(now_rfc3339());
        job_state.error = Some(message.to_string());
        let _ = state::write_job_state(state_root, &job_state);
    }

    DispatchOutcome {
        success: false,
        exit_code: job_result.exit_code,
        result: None,
        output_files: vec![],
        timing: job_result.timing,
        error: job_result.error,
        worker_pid,
        pending_ack: false,
        completion_signal_failed: false,
    }
}
