//! Log Interceptor (§4.D): line-framer over a worker's stdout/stderr.
//!
//! Grounded on the teacher's `run.rs::stream_to_logs` for the byte-buffer
//! accumulation / tee-to-multiple-sinks shape, and on
//! `internal/logs/writer.go` plus the `persistentWorkerLogInterceptor`
//! parsing described in `cmd/worker_supervisor.go` for the structured-log
//! grammar: `JOB_ID_<job_id>|<LEVEL>|<json-array>` (per-job frame) vs
//! `<LEVEL>|<json-array>` (worker frame) vs anything else (opaque frame).

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::paths;
use crate::timestamp::now_rfc3339;

const LEVELS: [&str; 6] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR", "FATAL"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultLevel {
    Info,
    Error,
}

impl DefaultLevel {
    fn as_str(self) -> &'static str {
        match self {
            DefaultLevel::Info => "INFO",
            DefaultLevel::Error => "ERROR",
        }
    }
}

enum Frame<'a> {
    PerJob {
        job_id: &'a str,
        level: &'a str,
        json_array: &'a str,
    },
    Worker {
        level: &'a str,
        json_array: &'a str,
    },
    Opaque,
}

/// Derive the bare port tag used in `WORKER_<port>` frames from a
/// `http_<port>` worker key (§3 "Worker key"). Falls back to the key
/// itself if it isn't in the canonical form, so a non-port-keyed worker
/// (per §3's "implementer MAY substitute a hash") still gets a stable tag.
fn port_tag(worker_key: &str) -> String {
    worker_key
        .strip_prefix("http_")
        .unwrap_or(worker_key)
        .to_string()
}

fn parse_frame(line: &str) -> Frame<'_> {
    if let Some(rest) = line.strip_prefix("JOB_ID_") {
        let mut parts = rest.splitn(3, '|');
        if let (Some(job_id), Some(level), Some(json_array)) =
            (parts.next(), parts.next(), parts.next())
        {
            if LEVELS.contains(&level) && !job_id.is_empty() {
                return Frame::PerJob {
                    job_id,
                    level,
                    json_array,
                };
            }
        }
        return Frame::Opaque;
    }

    let mut parts = line.splitn(2, '|');
    if let (Some(level), Some(json_array)) = (parts.next(), parts.next()) {
        if LEVELS.contains(&level) {
            return Frame::Worker { level, json_array };
        }
    }
    Frame::Opaque
}

/// Shared state behind a single mutex, per §4.D concurrency contract:
/// "closing the interceptor flushes any lazily-opened per-job files" and
/// log-interceptor writes are mutually exclusive in time per key.
struct Inner {
    log_root: PathBuf,
    /// The bare port tag used in `WORKER_<port>` frames (§4.D), derived
    /// from the canonical `http_<port>` worker key by stripping the
    /// `http_` prefix.
    port_tag: String,
    job_files: HashMap<String, File>,
    worker_file: File,
    unified_file: File,
}

/// A line-buffered sink shared by a worker's stdout and stderr streams.
pub struct LogInterceptor {
    inner: Mutex<Inner>,
}

impl LogInterceptor {
    pub fn open(log_root: &Path, worker_key: &str) -> Result<Arc<Self>> {
        paths::ensure_log_dirs(log_root)
            .with_context(|| format!("create log dirs under {}", log_root.display()))?;

        let worker_file = append_file(&paths::worker_log_path(log_root, worker_key))?;
        let unified_file = append_file(&paths::unified_log_path(log_root))?;

        Ok(Arc::new(LogInterceptor {
            inner: Mutex::new(Inner {
                log_root: log_root.to_path_buf(),
                port_tag: port_tag(worker_key),
                job_files: HashMap::new(),
                worker_file,
                unified_file,
            }),
        }))
    }

    /// Drain `stream` line by line, routing each line per §4.D, until EOF.
    /// Any trailing partial line (no final `\n`) is flushed as a line too.
    pub fn drain(self: &Arc<Self>, mut stream: impl Read, default_level: DefaultLevel) {
        let mut buf = [0u8; 8192];
        let mut line_buf: Vec<u8> = Vec::new();
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            for &byte in &buf[..n] {
                if byte == b'\n' {
                    self.route_line(&String::from_utf8_lossy(&line_buf), default_level);
                    line_buf.clear();
                } else {
                    line_buf.push(byte);
                }
            }
        }
        if !line_buf.is_empty() {
            self.route_line(&String::from_utf8_lossy(&line_buf), default_level);
        }
    }

    fn route_line(&self, line: &str, default_level: DefaultLevel) {
        let ts = now_rfc3339();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        match parse_frame(line) {
            Frame::PerJob {
                job_id,
                level,
                json_array,
            } => {
                let job_line = format!("{ts}|{level}|{json_array}\n");
                if let Ok(file) = inner.job_file(job_id) {
                    let _ = file.write_all(job_line.as_bytes());
                }
                let unified_line = format!("{ts}|JOB_ID_{job_id}|{level}|{json_array}\n");
                let _ = inner.unified_file.write_all(unified_line.as_bytes());
            }
            Frame::Worker { level, json_array } => {
                // §4.D: "append to the worker log with the worker port as
                // a tag, and to the unified log as
                // `<ts>|WORKER_<port>|<LEVEL>|<json-array>`" — both sinks
                // get the same tagged line.
                let tagged_line =
                    format!("{ts}|WORKER_{}|{level}|{json_array}\n", inner.port_tag);
                let _ = inner.worker_file.write_all(tagged_line.as_bytes());
                let _ = inner.unified_file.write_all(tagged_line.as_bytes());
            }
            Frame::Opaque => {
                let level = default_level.as_str();
                let escaped = escape_json_string(line);
                let array = format!("[\"{escaped}\"]");
                let tagged_line = format!("{ts}|WORKER_{}|{level}|{array}\n", inner.port_tag);
                let _ = inner.worker_file.write_all(tagged_line.as_bytes());
                let _ = inner.unified_file.write_all(tagged_line.as_bytes());
            }
        }
    }
}

impl Inner {
    fn job_file(&mut self, job_id: &str) -> Result<&mut File> {
        if !self.job_files.contains_key(job_id) {
            let path = paths::job_log_path(&self.log_root, job_id);
            let file = append_file(&path)?;
            self.job_files.insert(job_id.to_string(), file);
        }
        Ok(self.job_files.get_mut(job_id).expect("just inserted"))
    }
}

/// Drain a stream straight into a single job's own log file (§4.F step 6).
///
/// `exec_per_job` spawns exactly one worker for exactly one job, so there
/// is nothing to demultiplex by `job_id`/worker key — every frame, however
/// it parses, lands in this one file as a canonical `<ts>|<LEVEL>|<json>`
/// line.
pub fn drain_to_job_log(mut stream: impl Read, job_log_path: &Path, default_level: DefaultLevel) {
    let Ok(mut file) = append_file(job_log_path) else {
        return;
    };
    let mut buf = [0u8; 8192];
    let mut line_buf: Vec<u8> = Vec::new();
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for &byte in &buf[..n] {
            if byte == b'\n' {
                write_job_log_line(&mut file, &String::from_utf8_lossy(&line_buf), default_level);
                line_buf.clear();
            } else {
                line_buf.push(byte);
            }
        }
    }
    if !line_buf.is_empty() {
        write_job_log_line(&mut file, &String::from_utf8_lossy(&line_buf), default_level);
    }
}

fn write_job_log_line(file: &mut File, line: &str, default_level: DefaultLevel) {
    let ts = now_rfc3339();
    let rendered = match parse_frame(line) {
        Frame::PerJob {
            level, json_array, ..
        } => format!("{ts}|{level}|{json_array}\n"),
        Frame::Worker { level, json_array } => format!("{ts}|{level}|{json_array}\n"),
        Frame::Opaque => {
            let escaped = escape_json_string(line);
            format!("{ts}|{}|[\"{escaped}\"]\n", default_level.as_str())
        }
    };
    let _ = file.write_all(rendered.as_bytes());
}

fn append_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))
}

fn escape_json_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}
