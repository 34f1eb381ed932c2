//! On-disk and wire JSON types, plus the stdout envelope.
//!
//! Stdout carries exactly one JSON object per invocation (§6); everything
//! else — job state, job result, worker state, the worker→jobs index — is a
//! flat JSON document under the state root, read and written by
//! [`crate::state`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Serialize `value` and print it as a single line to stdout.
///
/// The only place stdout is written to, so the "stdout is JSON-only" rule
/// cannot be violated by a stray `println!` elsewhere in the crate.
pub fn print_json_to_stdout(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).expect("JSON serialization failed")
    );
}

// ---------- Job payload (input, not persisted) ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: String,
    pub job_class: String,
    pub worker_command: Vec<String>,
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub job_input: serde_json::Value,
    #[serde(default = "default_wait_for_completion")]
    pub wait_for_completion: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_location: Option<OutputLocation>,
}

fn default_wait_for_completion() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub kind: InterfaceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    ExecPerJob,
    PersistentHttp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLocation {
    pub folder_id: String,
    #[serde(default)]
    pub prefix: String,
}

// ---------- Persisted documents ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    ExecPerJob,
    PersistentHttp,
}

/// Persisted at `state/jobs/<job_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub job_class: String,
    pub status: JobStatus,
    pub worker_kind: WorkerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_state_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<JobMeta>,
}

impl JobState {
    pub fn new_pending(job_id: &str, job_class: &str, worker_kind: WorkerKind) -> Self {
        JobState {
            job_id: job_id.to_string(),
            job_class: job_class.to_string(),
            status: JobStatus::Pending,
            worker_kind,
            started_at: None,
            completed_at: None,
            worker_pid: None,
            worker_state_pid: None,
            error: None,
            meta: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

/// Persisted at `state/jobs/<job_id>.result.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub job_id: String,
    pub job_class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub output_files: Vec<OutputFileRef>,
    #[serde(default)]
    pub timing: Timing,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        JobError {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFileRef {
    pub folder_id: String,
    pub object_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timing {
    pub total_time_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_startup_time_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_execution_time_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_ready_time_seconds: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Ready,
    Unhealthy,
    Stopped,
}

/// Persisted at `state/workers/<worker-key>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub kind: WorkerKind,
    pub worker_command: Vec<String>,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub status: WorkerStatus,
    pub started_at: String,
    pub last_checked_at: String,
    pub agent_version: String,
}

/// Worker-produced manifest at `state/jobs/<job_id>/output/__manifest__.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputManifest {
    #[serde(default)]
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub local_path: String,
    pub folder_id: String,
    pub object_key: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

// ---------- persistent_http wire protocol (§4.G) ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpJobRequest {
    pub job_id: String,
    pub job_class: String,
    pub job_input: serde_json::Value,
    pub job_output_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpJobSubmitResponse {
    pub accepted: bool,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpJobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

// ---------- platform control-plane wire protocol ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadUrlRequest {
    pub folder_id: String,
    pub object_key: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadUrlResponse {
    pub uploads: Vec<PresignedUpload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignedUpload {
    pub folder_id: String,
    pub object_key: String,
    pub presigned_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub output_files: Vec<OutputFileRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timing: HashMap<String, f64>,
}

// ---------- stdout envelope (§6) ----------

#[derive(Debug, Clone, Serialize)]
pub struct AgentEnvelope {
    pub success: bool,
    pub job_id: String,
    pub job_class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub output_files: Vec<OutputFileRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_pid: Option<u32>,
    pub timing: Timing,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl AgentEnvelope {
    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_round_trips_through_json() {
        let state = JobState {
            job_id: "j1".into(),
            job_class: "demo".into(),
            status: JobStatus::Running,
            worker_kind: WorkerKind::ExecPerJob,
            started_at: Some("2026-07-28T00:00:00.000Z".into()),
            completed_at: None,
            worker_pid: Some(123),
            worker_state_pid: None,
            error: None,
            meta: None,
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: JobState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id, "j1");
        assert_eq!(back.status, JobStatus::Running);
        assert_eq!(back.worker_pid, Some(123));
    }

    #[test]
    fn envelope_omits_absent_optionals() {
        let env = AgentEnvelope {
            success: true,
            job_id: "j1".into(),
            job_class: "demo".into(),
            status: None,
            exit_code: None,
            result: None,
            output_files: vec![],
            worker_pid: None,
            timing: Timing {
                total_time_seconds: 0.5,
                ..Default::default()
            },
            error: None,
        };
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("status").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("output_files").is_none());
    }

    #[test]
    fn worker_key_is_encoded_as_http_port() {
        assert_eq!(crate::paths::worker_key(9101), "http_9101");
    }
}
