//! Worker Supervisor (§4.E): owns one persistent worker process for its
//! entire lifetime, publishes its [`WorkerState`], and reaps on exit.
//!
//! Grounded on `original_source/.../cmd/worker_supervisor.go` for the exact
//! state-machine sequencing, and on the teacher's `run.rs::supervise` for
//! the Rust spawn/thread/wait shape.

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::logs::{DefaultLevel, LogInterceptor};
use crate::lock;
use crate::paths;
use crate::state;
use crate::timestamp::now_rfc3339;
use crate::types::{WorkerKind, WorkerState, WorkerStatus};

/// Decoded from `worker-supervisor --worker-config-base64`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperviseConfig {
    pub worker_command: Vec<String>,
    pub port: u16,
}

pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(180);
const SETTLE_WAIT: Duration = Duration::from_millis(500);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTH_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn encode_config(config: &SuperviseConfig) -> Result<String> {
    let json = serde_json::to_vec(config)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}

pub fn decode_config(encoded: &str) -> Result<SuperviseConfig> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("decode base64 worker-supervisor config")?;
    serde_json::from_slice(&bytes).context("parse worker-supervisor config JSON")
}

/// Run the supervisor to completion: spawn the worker, publish state, wait
/// for readiness, then wait for exit. Returns once the worker has stopped.
pub fn run(config: &SuperviseConfig, state_root: &Path, log_root: &Path) -> Result<()> {
    if config.worker_command.is_empty() {
        anyhow::bail!("WORKER_START_ERROR: empty worker_command");
    }

    let worker_key = paths::worker_key(config.port);
    let lock_path = paths::worker_start_lock_path(state_root, &worker_key);
    let lock = lock::acquire_worker_start_lock(&lock_path, DEFAULT_READINESS_TIMEOUT)
        .context("acquiring worker start lock")?;

    if let Some(existing) = state::read_worker_state(state_root, &worker_key)? {
        if existing.status != WorkerStatus::Stopped && is_process_alive(existing.pid) {
            // §4.E: "already alive? ───────► return success (no-op)"
            return Ok(());
        }
    }

    let mut child = spawn_worker(&config.worker_command)
        .context("WORKER_START_ERROR: failed to spawn worker process")?;
    let pid = child.id();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    std::thread::sleep(SETTLE_WAIT);
    if let Ok(Some(_status)) = child.try_wait() {
        anyhow::bail!("WORKER_START_ERROR: worker exited immediately after spawn");
    }

    let started_at = now_rfc3339();
    write_state(
        state_root,
        &worker_key,
        config,
        pid,
        WorkerStatus::Starting,
        &started_at,
    )?;

    let interceptor = LogInterceptor::open(log_root, &worker_key)
        .context("opening log interceptor for worker")?;
    let log_threads = spawn_log_threads(interceptor, stdout, stderr);

    let ready = poll_readiness(config.port, DEFAULT_READINESS_TIMEOUT);

    if ready {
        write_state(
            state_root,
            &worker_key,
            config,
            pid,
            WorkerStatus::Ready,
            &started_at,
        )?;
        // §4.E: "RELEASE start-lock" the instant readiness is published.
        drop(lock);
    } else {
        write_state(
            state_root,
            &worker_key,
            config,
            pid,
            WorkerStatus::Unhealthy,
            &started_at,
        )?;
        // Lock is held until this function returns (dropped below),
        // matching the Go supervisor's defer-release-on-timeout behavior.
    }

    let exit_status = child.wait().context("waiting for worker process exit")?;
    for handle in log_threads {
        let _ = handle.join();
    }

    tracing::info!(
        worker_key = %worker_key,
        pid,
        exit_code = exit_status.code(),
        signal = exit_status.signal(),
        "worker process stopped"
    );

    write_state(
        state_root,
        &worker_key,
        config,
        pid,
        WorkerStatus::Stopped,
        &started_at,
    )?;

    // `lock` drops here unconditionally if it was not already dropped above.
    Ok(())
}

fn spawn_worker(command: &[String]) -> std::io::Result<Child> {
    Command::new(&command[0])
        .args(&command[1..])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

fn spawn_log_threads(
    interceptor: std::sync::Arc<LogInterceptor>,
    stdout: Option<impl Read + Send + 'static>,
    stderr: Option<impl Read + Send + 'static>,
) -> Vec<std::thread::JoinHandle<()>> {
    let mut handles = Vec::new();
    if let Some(stdout) = stdout {
        let interceptor = interceptor.clone();
        handles.push(std::thread::spawn(move || {
            interceptor.drain(stdout, DefaultLevel::Info);
        }));
    }
    if let Some(stderr) = stderr {
        handles.push(std::thread::spawn(move || {
            interceptor.drain(stderr, DefaultLevel::Error);
        }));
    }
    handles
}

fn write_state(
    state_root: &Path,
    worker_key: &str,
    config: &SuperviseConfig,
    pid: u32,
    status: WorkerStatus,
    started_at: &str,
) -> Result<()> {
    let state = WorkerState {
        kind: WorkerKind::PersistentHttp,
        worker_command: config.worker_command.clone(),
        pid,
        port: Some(config.port),
        status,
        started_at: started_at.to_string(),
        last_checked_at: now_rfc3339(),
        agent_version: paths::AGENT_VERSION.to_string(),
    };
    state::write_worker_state(state_root, worker_key, &state)
}

/// Poll `GET /health/ready` until it returns 200 or `timeout` elapses.
pub fn poll_readiness(port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let agent = ureq::AgentBuilder::new()
        .timeout(HEALTH_CLIENT_TIMEOUT)
        .build();
    loop {
        if probe_ready(&agent, port) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(READINESS_POLL_INTERVAL);
    }
}

fn probe_ready(agent: &ureq::Agent, port: u16) -> bool {
    let url = format!("http://127.0.0.1:{port}/health/ready");
    matches!(
        agent.get(&url).timeout(HEALTH_REQUEST_TIMEOUT).call(),
        Ok(resp) if resp.status() == 200
    )
}

/// `libc::kill(pid, 0)` liveness check (§4.E "already alive?").
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 sends no signal, only checks existence/permission.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_base64() {
        let config = SuperviseConfig {
            worker_command: vec!["/usr/bin/my-worker".into(), "--flag".into()],
            port: 9101,
        };
        let encoded = encode_config(&config).unwrap();
        let decoded = decode_config(&encoded).unwrap();
        assert_eq!(decoded.port, 9101);
        assert_eq!(decoded.worker_command, config.worker_command);
    }

    #[test]
    fn empty_worker_command_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SuperviseConfig {
            worker_command: vec![],
            port: 9102,
        };
        let result = run(&config, tmp.path(), tmp.path());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("WORKER_START_ERROR"));
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!is_process_alive(0));
    }

    #[test]
    fn readiness_poll_fails_fast_against_a_closed_port() {
        // Port 1 is a privileged, almost certainly-closed port in test
        // sandboxes; a short timeout keeps this test fast.
        let ready = poll_readiness(1, Duration::from_millis(50));
        assert!(!ready);
    }
}
