//! Dispatchers (§4.F, §4.G): the two execution disciplines that run a job
//! end-to-end and report a uniform outcome back to the Lifecycle
//! Orchestrator (§4.I).

pub mod cancel;
pub mod exec_per_job;
pub mod persistent_http;

use crate::types::{JobError, OutputFileRef, Timing};

/// The uniform result of running a job end-to-end, independent of which
/// dispatcher produced it. The orchestrator turns this into the stdout
/// envelope (§6) and the process exit code (§7).
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub result: Option<serde_json::Value>,
    pub output_files: Vec<OutputFileRef>,
    pub timing: Timing,
    pub error: Option<JobError>,
    pub worker_pid: Option<u32>,
    /// True when this outcome is the async "pending" acknowledgment
    /// (§4.H), not a terminal result.
    pub pending_ack: bool,
    /// True when the control-plane completion notification failed (§4.F
    /// step 12, §4.G step 10). §7: "completion-signal failure leaves the
    /// job in its computed state … then exits 1" — the envelope's
    /// `success` is unaffected, but the process exit code is not.
    pub completion_signal_failed: bool,
}

impl DispatchOutcome {
    /// The process exit code per §7: the worker's own exit code when it
    /// ran and the agent itself didn't fail, 0 on full success, else 1.
    pub fn process_exit_code(&self) -> i32 {
        if self.pending_ack {
            return 0;
        }
        if self.completion_signal_failed {
            return 1;
        }
        if self.success {
            return 0;
        }
        match self.exit_code {
            Some(code) if code != 0 => code,
            _ => 1,
        }
    }
}
