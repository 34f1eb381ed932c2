//! Dispatcher — `persistent_http` (§4.G): targets a worker owned by a
//! supervisor addressable as `http://127.0.0.1:<port>`.
//!
//! Grounded on `original_source/.../internal/runner/http.go` and
//! `cancel.go`, with two deviations `spec.md` itself calls out: worker-alive
//! keying is by port (`http_<port>`), not `job_class`, and worker-supervisor
//! launch goes through the re-exec path rather than a supervisor-less
//! background spawn.

use anyhow::{Context, Result};
use std::time::{Duration, Instant};

use crate::dispatch::{cancel, DispatchOutcome};
use crate::platform::PlatformClient;
use crate::supervisor::{self, SuperviseConfig};
use crate::types::{
    HttpJobRequest, HttpJobStatusResponse, JobError, JobPayload, JobResult, JobState, JobStatus,
    Timing, WorkerKind, WorkerStatus,
};
use crate::{async_dispatch, paths, state, timestamp::now_rfc3339};

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_POLL_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const OVERALL_POLL_DEADLINE: Duration = Duration::from_secs(30 * 60);
const WORKER_ALIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn run(
    payload: &JobPayload,
    state_root: &std::path::Path,
    log_root: &std::path::Path,
    invocation_start: Instant,
    platform: Option<&PlatformClient>,
) -> Result<DispatchOutcome> {
    let port = match payload.interface.port {
        Some(p) if p > 0 => p,
        _ => {
            return Ok(fail_new(
                state_root,
                payload,
                invocation_start,
                "WORKER_START_ERROR",
                "persistent_http requires a positive port",
            ));
        }
    };
    let worker_key = paths::worker_key(port);

    let mut job_state = JobState::new_pending(&payload.job_id, &payload.job_class, WorkerKind::PersistentHttp);
    state::write_http_job_state(state_root, &job_state, &worker_key)?;

    // Step 3: async delegation — acknowledge immediately and let the
    // detached child carry the job to completion (§4.H).
    if !payload.wait_for_completion {
        return async_dispatch::dispatch(payload, state_root, log_root, invocation_start);
    }

    let worker_ready_start = Instant::now();
    let readiness = ensure_worker_ready(
        state_root,
        log_root,
        &worker_key,
        &payload.worker_command,
        port,
    );
    let worker_ready_time_seconds = worker_ready_start.elapsed().as_secs_f64();

    if let Err(e) = readiness {
        return Ok(fail_with_timing(
            state_root,
            &mut job_state,
            invocation_start,
            "WORKER_NOT_READY",
            &e.to_string(),
            Timing {
                total_time_seconds: invocation_start.elapsed().as_secs_f64(),
                worker_ready_time_seconds: Some(worker_ready_time_seconds),
                ..Default::default()
            },
        ));
    }

    if let Some(platform) = platform {
        if platform.is_configured() {
            if let Err(e) = platform.signal_start(&payload.job_id) {
                cancel::cancel_persistent_http_job(port, &payload.job_id);
                return Ok(cancelled(
                    state_root,
                    &mut job_state,
                    "PLATFORM_START_SIGNAL_ERROR",
                    &e.to_string(),
                ));
            }
        }
    }

    let output_dir = paths::job_output_dir(state_root, &payload.job_id);
    std::fs::create_dir_all(&output_dir)?;
    let submit_agent = ureq::AgentBuilder::new().timeout(SUBMIT_TIMEOUT).build();
    let submit_req = HttpJobRequest {
        job_id: payload.job_id.clone(),
        job_class: payload.job_class.clone(),
        job_input: payload.job_input.clone(),
        job_output_dir: output_dir.display().to_string(),
    };
    let submit_url = format!("http://127.0.0.1:{port}/job");
    let submit_result = submit_agent.post(&submit_url).send_json(serde_json::to_value(&submit_req)?);

    match submit_result {
        Ok(resp) => {
            let parsed: Result<crate::types::HttpJobSubmitResponse, _> = resp.into_json();
            match parsed {
                Ok(body) if body.accepted => {}
                Ok(body) => {
                    let message = body
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "worker rejected job".to_string());
                    return Ok(fail_with_timing(
                        state_root,
                        &mut job_state,
                        invocation_start,
                        "JOB_NOT_ACCEPTED",
                        &message,
                        Default::default(),
                    ));
                }
                Err(e) => {
                    return Ok(fail_with_timing(
                        state_root,
                        &mut job_state,
                        invocation_start,
                        "JOB_SUBMIT_FAILED",
                        &format!("malformed submit response: {e}"),
                        Default::default(),
                    ));
                }
            }
        }
        Err(e) => {
            return Ok(fail_with_timing(
                state_root,
                &mut job_state,
                invocation_start,
                "JOB_SUBMIT_FAILED",
                &e.to_string(),
                Default::default(),
            ));
        }
    }

    job_state.status = JobStatus::Running;
    job_state.started_at = Some(now_rfc3339());
    state::write_http_job_state(state_root, &job_state, &worker_key)?;

    let job_start = Instant::now();
    let poll_agent = ureq::AgentBuilder::new().timeout(STATUS_POLL_TIMEOUT).build();
    let status_url = format!("http://127.0.0.1:{port}/job/{}", payload.job_id);
    let deadline = job_start + OVERALL_POLL_DEADLINE;

    let terminal = loop {
        if Instant::now() >= deadline {
            return Ok(fail_with_timing(
                state_root,
                &mut job_state,
                invocation_start,
                "JOB_POLL_TIMEOUT",
                "job did not reach a terminal status within the poll deadline",
                Timing {
                    total_time_seconds: invocation_start.elapsed().as_secs_f64(),
                    job_execution_time_seconds: Some(job_start.elapsed().as_secs_f64()),
                    worker_ready_time_seconds: Some(worker_ready_time_seconds),
                    ..Default::default()
                },
            ));
        }
        match poll_agent.get(&status_url).call() {
            Ok(resp) => match resp.into_json::<HttpJobStatusResponse>() {
                Ok(body) if body.status.is_terminal() => break body,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "malformed status poll response, retrying"),
            },
            Err(e) => tracing::warn!(error = %e, "status poll transport error, retrying"),
        }
        std::thread::sleep(STATUS_POLL_INTERVAL);
    };

    let job_execution_time_seconds = job_start.elapsed().as_secs_f64();
    let mut success = terminal.status == JobStatus::Success;
    let mut error = terminal.error.clone().or_else(|| {
        if success {
            None
        } else {
            Some(JobError::new("WORKER_EXIT_ERROR", "worker reported job failure"))
        }
    });

    let mut output_files = Vec::new();
    if let Some(platform) = platform {
        if success && platform.is_configured() {
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

    let mut completion_signal_failed = false;
    if let Some(platform) = platform {
        if platform.is_configured() {
            let completion = crate::types::CompletionRequest {
                success,
                result: terminal.result.clone(),
                error: error.clone(),
                output_files: output_files.clone(),
                exit_code: None,
                timing: Default::default(),
            };
            if let Err(e) = platform.signal_completion(&payload.job_id, &completion) {
                tracing::warn!(error = %e, "completion signal failed");
                completion_signal_failed = true;
                let note = "; completion_signal_failed";
                error = Some(match error {
                    Some(mut existing) => {
                        existing.message.push_str(note);
                        existing
                    }
                    None => JobError::new("completion_signal_failed", "completion signal failed"),
                });
            }
        }
    }

    let timing = Timing {
        total_time_seconds: invocation_start.elapsed().as_secs_f64(),
        worker_startup_time_seconds: None,
        job_execution_time_seconds: Some(job_execution_time_seconds),
        worker_ready_time_seconds: Some(worker_ready_time_seconds),
    };

    let job_result = JobResult {
        success,
        job_id: payload.job_id.clone(),
        job_class: payload.job_class.clone(),
        result: terminal.result.clone(),
        error: error.clone(),
        output_files: output_files.clone(),
        timing: timing.clone(),
        exit_code: None,
    };
    state::write_job_result(state_root, &job_result)?;

    job_state.status = if success { JobStatus::Success } else { JobStatus::Failed };
    job_state.completed_at = Some(now_rfc3339());
    job_state.error = error.as_ref().map(|e| e.message.clone());
    state::write_http_job_state(state_root, &job_state, &worker_key)?;

    Ok(DispatchOutcome {
        success,
        exit_code: None,
        result: job_result.result,
        output_files,
        timing,
        error,
        worker_pid: None,
        pending_ack: false,
        completion_signal_failed,
    })
}

/// Ensure-worker-ready sub-protocol (§4.G). Returns once `/health/ready`
/// has answered 200, or an error classified as `WORKER_NOT_READY`.
fn ensure_worker_ready(
    state_root: &std::path::Path,
    log_root: &std::path::Path,
    worker_key: &str,
    worker_command: &[String],
    port: u16,
) -> Result<()> {
    let deadline = Instant::now() + supervisor::DEFAULT_READINESS_TIMEOUT;

    if is_worker_alive(state_root, worker_key) {
        if supervisor::poll_readiness(port, Duration::from_secs(0)) {
            return Ok(());
        }
        return wait_for_probe_ready(port, deadline);
    }

    let existing = state::read_worker_state(state_root, worker_key)?;
    if let Some(ws) = existing {
        if ws.status == WorkerStatus::Starting {
            wait_for_worker_to_start(state_root, worker_key, deadline)?;
            return wait_for_probe_ready(port, deadline);
        }
    }

    launch_worker_supervisor(worker_command, port, state_root, log_root)?;
    wait_for_worker_to_start(state_root, worker_key, deadline)?;
    wait_for_probe_ready(port, deadline)
}

fn is_worker_alive(state_root: &std::path::Path, worker_key: &str) -> bool {
    match state::read_worker_state(state_root, worker_key) {
        Ok(Some(ws)) => supervisor::is_process_alive(ws.pid),
        _ => false,
    }
}

fn wait_for_worker_to_start(
    state_root: &std::path::Path,
    worker_key: &str,
    deadline: Instant,
) -> Result<()> {
    loop {
        if let Ok(Some(ws)) = state::read_worker_state(state_root, worker_key) {
            if ws.pid > 0 && supervisor::is_process_alive(ws.pid) {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            anyhow::bail!("worker did not start within the readiness deadline");
        }
        std::thread::sleep(WORKER_ALIVE_POLL_INTERVAL);
    }
}

fn wait_for_probe_ready(port: u16, deadline: Instant) -> Result<()> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            anyhow::bail!("worker never became ready on /health/ready");
        }
        if supervisor::poll_readiness(port, remaining.min(Duration::from_millis(500))) {
            return Ok(());
        }
    }
}

/// Launch a worker-supervisor for `worker_command`/`port`, re-exec style
/// (§4.H-style launch, subcommand `worker-supervisor`).
fn launch_worker_supervisor(
    worker_command: &[String],
    port: u16,
    state_root: &std::path::Path,
    log_root: &std::path::Path,
) -> Result<()> {
    let config = SuperviseConfig {
        worker_command: worker_command.to_vec(),
        port,
    };
    let encoded = supervisor::encode_config(&config)?;
    let exe = std::env::current_exe().context("resolving current executable for re-exec")?;
    std::process::Command::new(exe)
        .arg("worker-supervisor")
        .arg("--root")
        .arg(state_root)
        .arg("--log-root")
        .arg(log_root)
        .arg("--worker-config-base64")
        .arg(encoded)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("WORKER_START_ERROR: failed to re-exec worker-supervisor")?;
    Ok(())
}

fn fail_new(
    state_root: &std::path::Path,
    payload: &JobPayload,
    invocation_start: Instant,
    code: &str,
    message: &str,
) -> DispatchOutcome {
    let mut job_state = JobState::new_pending(&payload.job_id, &payload.job_class, WorkerKind::PersistentHttp);
    fail_with_timing(
        state_root,
        &mut job_state,
        invocation_start,
        code,
        message,
        Default::default(),
    )
}

fn fail_with_timing(
    state_root: &std::path::Path,
    job_state: &mut JobState,
    invocation_start: Instant,
    code: &str,
    message: &str,
    mut timing: Timing,
) -> DispatchOutcome {
    if timing.total_time_seconds == 0.0 {
        timing.total_time_seconds = invocation_start.elapsed().as_secs_f64();
    }
    let error = JobError::new(code, message);
    let job_result = JobResult {
        success: false,
        job_id: job_state.job_id.clone(),
        job_class: job_state.job_class.clone(),
        result: None,
        error: Some(error.clone()),
        output_files: vec![],
        timing: timing.clone(),
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
        timing,
        error: Some(error),
        worker_pid: None,
        pending_ack: false,
        completion_signal_failed: false,
    }
}

fn cancelled(
    state_root: &std::path::Path,
    job_state: &mut JobState,
    code: &str,
    message: &str,
) -> DispatchOutcome {
    let job_result = cancel::build_cancelled_result(&job_state.job_id, &job_state.job_class, code, message);
    let _ = state::write_job_result(state_root, &job_result);

    job_state.status = JobStatus::Failed;
    job_state.completed_at = Some(now_rfc3339());
    job_state.error = Some(message.to_string());
    let _ = state::write_job_state(state_root, job_state);

    DispatchOutcome {
        success: false,
        exit_code: job_result.exit_code,
        result: None,
        output_files: vec![],
        timing: job_result.timing,
        error: job_result.error,
        worker_pid: None,
        pending_ack: false,
        completion_signal_failed: false,
    }
}
