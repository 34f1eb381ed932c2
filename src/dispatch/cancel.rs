//! Cancel subroutine (§4.G "Cancel subroutine", invoked from §4.F step 7
//! and §4.G step 5 on a platform start-signal failure).
//!
//! Grounded on `original_source/.../internal/runner/cancel.go`: for
//! `exec_per_job`, kill the worker process directly with a grace period;
//! for `persistent_http`, best-effort POST `/job/<id>/cancel` and — per
//! §8 invariant 5 "No collateral kill" — never touch the persistent
//! worker itself.

use std::process::Child;
use std::time::{Duration, Instant};

use crate::types::{JobError, JobResult};

const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CANCEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Kill `child` with SIGKILL, waiting up to 5s, re-sending SIGKILL if it
/// hasn't exited by then.
pub fn kill_exec_per_job(child: &mut Child) {
    send_sigkill(child.id());
    let deadline = Instant::now() + KILL_GRACE_PERIOD;
    loop {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        if Instant::now() >= deadline {
            send_sigkill(child.id());
            let _ = child.wait();
            return;
        }
        std::thread::sleep(KILL_POLL_INTERVAL);
    }
}

fn send_sigkill(pid: u32) {
    // SAFETY: pid is our own child's pid; SIGKILL to a process we own.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

/// Best-effort cancel of an in-flight job on a persistent worker. Never
/// terminates the worker process itself (§8 invariant 5).
pub fn cancel_persistent_http_job(port: u16, job_id: &str) {
    let agent = ureq::AgentBuilder::new()
        .timeout(CANCEL_REQUEST_TIMEOUT)
        .build();
    let url = format!("http://127.0.0.1:{port}/job/{job_id}/cancel");
    let _ = agent.post(&url).call();
}

/// Build the `JobResult` recorded for a cancelled job: failed, with a
/// non-zero `exit_code` and the supplied error classification.
pub fn build_cancelled_result(
    job_id: &str,
    job_class: &str,
    error_code: &str,
    error_message: &str,
) -> JobResult {
    JobResult {
        success: false,
        job_id: job_id.to_string(),
        job_class: job_class.to_string(),
        result: None,
        error: Some(JobError::new(error_code, error_message)),
        output_files: vec![],
        timing: Default::default(),
        exit_code: Some(1),
    }
}
