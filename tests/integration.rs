//! Black-box tests for the `worker-agent` binary.
//!
//! Each test runs the compiled binary under an isolated temp state/log
//! root and validates the stdout envelope (§6), following the teacher's
//! `TestHarness` pattern: spawn the real binary, parse its single stdout
//! JSON line, assert on exit code and envelope fields.

use std::path::PathBuf;
use std::process::Command;

fn binary() -> PathBuf {
    let mut p = std::env::current_exe().expect("current exe");
    p.pop();
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("worker-agent");
    if cfg!(windows) {
        p.set_extension("exe");
    }
    p
}

/// Isolated state+log root for one test, cleaned up on drop.
struct TestHarness {
    _tmp: tempfile::TempDir,
    state_root: String,
    log_root: String,
}

impl TestHarness {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let state_root = tmp.path().join("state").to_str().unwrap().to_string();
        let log_root = tmp.path().join("logs").to_str().unwrap().to_string();
        Self {
            _tmp: tmp,
            state_root,
            log_root,
        }
    }

    fn run(&self, args: &[&str]) -> (i32, serde_json::Value, String) {
        let bin = binary();
        let mut cmd = Command::new(&bin);
        cmd.arg("--root")
            .arg(&self.state_root)
            .arg("--log-root")
            .arg(&self.log_root)
            .args(args);
        let output = cmd.output().expect("run binary");
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        let lines: Vec<&str> = stdout.trim_end().lines().collect();
        assert_eq!(
            lines.len(),
            1,
            "stdout must be exactly one JSON line (stderr: {stderr})\nargs: {args:?}\nstdout: {stdout:?}"
        );
        let json = serde_json::from_str(lines[0]).unwrap_or_else(|e| {
            panic!("stdout line is not valid JSON: {e}\nline: {}\nstderr: {stderr}", lines[0])
        });
        (output.status.code().unwrap_or(-1), json, stderr)
    }

    fn payload_base64(&self, payload: &serde_json::Value) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(payload.to_string())
    }
}

fn exec_per_job_payload(job_id: &str, command: Vec<&str>, wait: bool) -> serde_json::Value {
    serde_json::json!({
        "job_id": job_id,
        "job_class": "demo",
        "worker_command": command,
        "interface": {"kind": "exec_per_job"},
        "job_input": {},
        "wait_for_completion": wait,
    })
}

#[test]
fn run_job_exec_per_job_happy_path_succeeds() {
    let h = TestHarness::new();
    let payload = exec_per_job_payload("job-1", vec!["/bin/echo", "hi"], true);
    let encoded = h.payload_base64(&payload);
    let (code, envelope, _stderr) = h.run(&["run-job", "--payload-base64", &encoded]);

    assert_eq!(code, 0);
    assert_eq!(envelope["success"], serde_json::json!(true));
    assert_eq!(envelope["job_id"], serde_json::json!("job-1"));
    assert_eq!(envelope["exit_code"], serde_json::json!(0));
    assert!(envelope["timing"]["total_time_seconds"].as_f64().unwrap() >= 0.0);
}

#[test]
fn run_job_non_zero_exit_is_reported_as_failure() {
    let h = TestHarness::new();
    let payload = exec_per_job_payload("job-2", vec!["/bin/sh", "-c", "exit 7"], true);
    let encoded = h.payload_base64(&payload);
    let (code, envelope, _stderr) = h.run(&["run-job", "--payload-base64", &encoded]);

    assert_eq!(code, 7);
    assert_eq!(envelope["success"], serde_json::json!(false));
    assert_eq!(envelope["error"]["code"], serde_json::json!("WORKER_EXIT_ERROR"));
}

#[test]
fn run_job_empty_worker_command_fails_without_spawning() {
    let h = TestHarness::new();
    let payload = exec_per_job_payload("job-3", vec![], true);
    let encoded = h.payload_base64(&payload);
    let (code, envelope, _stderr) = h.run(&["run-job", "--payload-base64", &encoded]);

    assert_eq!(code, 1);
    assert_eq!(envelope["success"], serde_json::json!(false));
    assert_eq!(envelope["error"]["code"], serde_json::json!("WORKER_START_ERROR"));
}

#[test]
fn run_job_malformed_payload_is_a_clean_json_failure() {
    let h = TestHarness::new();
    let (code, envelope, _stderr) = h.run(&["run-job", "--payload-base64", "not-valid-base64!!"]);

    assert_eq!(code, 1);
    assert_eq!(envelope["success"], serde_json::json!(false));
    assert!(envelope["error"]["code"].is_string());
}

#[test]
fn run_job_missing_job_id_fails_validation() {
    let h = TestHarness::new();
    let mut payload = exec_per_job_payload("", vec!["/bin/echo", "hi"], true);
    payload["job_id"] = serde_json::json!("");
    let encoded = h.payload_base64(&payload);
    let (code, envelope, _stderr) = h.run(&["run-job", "--payload-base64", &encoded]);

    assert_eq!(code, 1);
    assert_eq!(envelope["error"]["code"], serde_json::json!("WORKER_START_ERROR"));
}

#[test]
fn run_job_async_dispatch_returns_pending_ack_immediately() {
    let h = TestHarness::new();
    let payload = exec_per_job_payload("job-async-1", vec!["/bin/sleep", "1"], false);
    let encoded = h.payload_base64(&payload);
    let (code, envelope, _stderr) = h.run(&["run-job", "--payload-base64", &encoded]);

    assert_eq!(code, 0);
    assert_eq!(envelope["success"], serde_json::json!(true));
    assert_eq!(envelope["status"], serde_json::json!("pending"));
    assert!(envelope.get("exit_code").is_none() || envelope["exit_code"].is_null());
}

#[test]
fn run_job_persistent_http_with_missing_port_fails_fast() {
    let h = TestHarness::new();
    let payload = serde_json::json!({
        "job_id": "job-http-1",
        "job_class": "demo",
        "worker_command": ["/usr/bin/worker"],
        "interface": {"kind": "persistent_http"},
        "job_input": {},
        "wait_for_completion": true,
    });
    let encoded = h.payload_base64(&payload);
    let (code, envelope, _stderr) = h.run(&["run-job", "--payload-base64", &encoded]);

    assert_eq!(code, 1);
    assert_eq!(envelope["success"], serde_json::json!(false));
}

// ---------- minimal in-process HTTP/1.1 stub worker ----------
//
// `persistent_http` scenarios need something answering `/health/ready`,
// `POST /job`, and `GET /job/<id>` on a real loopback port. Pulling in a
// server framework for three fixed routes would be overkill, so this is a
// hand-rolled HTTP/1.1 responder over `std::net::TcpListener` — test-only,
// no new crate (see DESIGN.md).
mod stub_worker {
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone)]
    pub struct JobRecord {
        pub status: &'static str,
        pub result: serde_json::Value,
    }

    pub struct StubWorker {
        pub jobs: Arc<Mutex<HashMap<String, JobRecord>>>,
    }

    /// Bind `port` and serve requests on a background thread until the test
    /// process exits. A submitted job flips from `running` to `success`
    /// with `{"v": 1}` after `settle` to give polling something to observe.
    pub fn spawn(port: u16, settle: Duration) -> StubWorker {
        let jobs: Arc<Mutex<HashMap<String, JobRecord>>> = Arc::new(Mutex::new(HashMap::new()));
        let listener = TcpListener::bind(("127.0.0.1", port))
            .unwrap_or_else(|e| panic!("bind stub worker on {port}: {e}"));

        let jobs_for_thread = jobs.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let jobs = jobs_for_thread.clone();
                std::thread::spawn(move || handle_connection(stream, jobs, settle));
            }
        });
        StubWorker { jobs }
    }

    fn handle_connection(
        mut stream: TcpStream,
        jobs: Arc<Mutex<HashMap<String, JobRecord>>>,
        settle: Duration,
    ) {
        let Some((method, path, body)) = read_request(&mut stream) else {
            return;
        };

        if method == "GET" && path == "/health/ready" {
            respond(&mut stream, 200, "{}");
            return;
        }

        if method == "POST" && path == "/job" {
            let req: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let job_id = req
                .get("job_id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            jobs.lock().unwrap().insert(
                job_id.clone(),
                JobRecord {
                    status: "running",
                    result: serde_json::Value::Null,
                },
            );
            let jobs_for_timer = jobs.clone();
            let job_id_for_timer = job_id.clone();
            std::thread::spawn(move || {
                std::thread::sleep(settle);
                jobs_for_timer.lock().unwrap().insert(
                    job_id_for_timer,
                    JobRecord {
                        status: "success",
                        result: serde_json::json!({"v": 1}),
                    },
                );
            });
            let body = serde_json::json!({"accepted": true, "job_id": job_id}).to_string();
            respond(&mut stream, 200, &body);
            return;
        }

        if method == "GET" && path.starts_with("/job/") {
            let job_id = &path["/job/".len()..];
            let record = jobs.lock().unwrap().get(job_id).cloned();
            let body = match record {
                Some(r) => serde_json::json!({
                    "job_id": job_id,
                    "status": r.status,
                    "result": r.result,
                })
                .to_string(),
                None => serde_json::json!({"job_id": job_id, "status": "pending"}).to_string(),
            };
            respond(&mut stream, 200, &body);
            return;
        }

        respond(&mut stream, 404, "{}");
    }

    fn read_request(stream: &mut TcpStream) -> Option<(String, String, Vec<u8>)> {
        let mut reader = BufReader::new(stream.try_clone().ok()?);
        let mut request_line = String::new();
        reader.read_line(&mut request_line).ok()?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_string();
        let path = parts.next()?.to_string();

        let mut content_length = 0usize;
        loop {
            let mut header_line = String::new();
            reader.read_line(&mut header_line).ok()?;
            if header_line == "\r\n" || header_line.is_empty() {
                break;
            }
            if let Some(value) = header_line
                .to_ascii_lowercase()
                .strip_prefix("content-length:")
            {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }

        let mut body = vec![0u8; content_length];
        if content_length > 0 {
            reader.read_exact(&mut body).ok()?;
        }
        Some((method, path, body))
    }

    fn respond(stream: &mut TcpStream, status: u16, body: &str) {
        let reason = if status == 200 { "OK" } else { "Not Found" };
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.flush();
    }
}

/// Pre-publish a `WorkerState{status: ready}` keyed to this test process's
/// own pid, so `persistent_http`'s `ensure_worker_ready` sees a live worker
/// without us having to spawn a real worker-supervisor subprocess.
fn seed_ready_worker_state(state_root: &str, port: u16) {
    let worker_key = format!("http_{port}");
    let path = std::path::Path::new(state_root)
        .join("workers")
        .join(format!("{worker_key}.json"));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let state = serde_json::json!({
        "kind": "persistent_http",
        "worker_command": ["/usr/bin/stub-worker"],
        "pid": std::process::id(),
        "port": port,
        "status": "ready",
        "started_at": "2026-07-28T00:00:00.000Z",
        "last_checked_at": "2026-07-28T00:00:00.000Z",
        "agent_version": "0.1.0",
    });
    std::fs::write(&path, serde_json::to_string_pretty(&state).unwrap()).unwrap();
}

#[test]
fn run_job_persistent_http_happy_path_against_stub_worker() {
    use std::time::Duration;

    let h = TestHarness::new();
    let port = 19101;
    let _worker = stub_worker::spawn(port, Duration::from_millis(200));
    seed_ready_worker_state(&h.state_root, port);

    let payload = serde_json::json!({
        "job_id": "job-http-happy",
        "job_class": "demo",
        "worker_command": ["/usr/bin/stub-worker"],
        "interface": {"kind": "persistent_http", "port": port},
        "job_input": {},
        "wait_for_completion": true,
    });
    let encoded = h.payload_base64(&payload);
    let (code, envelope, stderr) = h.run(&["run-job", "--payload-base64", &encoded]);

    assert_eq!(code, 0, "stderr: {stderr}");
    assert_eq!(envelope["success"], serde_json::json!(true));
    assert_eq!(envelope["result"]["v"], serde_json::json!(1));
    assert!(envelope["timing"]["job_execution_time_seconds"]
        .as_f64()
        .unwrap()
        >= 0.19);
}

#[test]
fn start_with_bad_warmup_args_exits_nonzero_on_stderr() {
    let h = TestHarness::new();
    let bin = binary();
    let output = Command::new(&bin)
        .arg("--root")
        .arg(&h.state_root)
        .arg("--log-root")
        .arg(&h.log_root)
        .args(["start", "--bogus-flag"])
        .output()
        .expect("run binary");

    assert!(!output.status.success());
}
