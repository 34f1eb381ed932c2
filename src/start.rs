//! `start` — the PID-1 entrypoint (§6): enables the zombie reaper, launches
//! any `--warmup <port> <cmd…>` worker supervisors, then tails the unified
//! log to stdout until SIGTERM/SIGINT.
//!
//! Grounded on `original_source/.../cmd/start.go`: same warmup-group
//! parsing, same log-file-as-agent-log redirection for the warmup
//! supervisor's own stdio, same truncation-aware tail-from-EOF loop.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::supervisor::SuperviseConfig;
use crate::{paths, reaper, supervisor};

const EOF_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct WarmupSpec {
    pub port: u16,
    pub command: Vec<String>,
}

/// Parse repeated `--warmup <port> <cmd…>` groups, cobra-`DisableFlagParsing`
/// style: everything up to the next `--warmup` (or end of args) is the
/// command for the preceding port.
pub fn parse_warmups(args: &[String]) -> Result<Vec<WarmupSpec>> {
    let mut warmups = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--warmup" => {
                if i + 2 >= args.len() {
                    anyhow::bail!("warmup requires a port and command");
                }
                let port: u16 = args[i + 1]
                    .parse()
                    .ok()
                    .filter(|p| *p > 0)
                    .with_context(|| format!("invalid warmup port {:?}", args[i + 1]))?;
                i += 2;
                let start = i;
                while i < args.len() && args[i] != "--warmup" {
                    i += 1;
                }
                let command = args[start..i].to_vec();
                if command.is_empty() {
                    anyhow::bail!("warmup for port {port} requires a command");
                }
                warmups.push(WarmupSpec { port, command });
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(warmups)
}

pub fn run(warmups: &[String], state_root: &Path, log_root: &Path) -> Result<()> {
    let specs = parse_warmups(warmups)?;

    reaper::install_and_enable().context("enabling PID-1 zombie reaper")?;

    for spec in &specs {
        launch_warmup_supervisor(spec, state_root, log_root)?;
    }

    paths::ensure_log_dirs(log_root)
        .with_context(|| format!("create log dirs under {}", log_root.display()))?;
    let unified_log_path = paths::unified_log_path(log_root);
    if !unified_log_path.exists() {
        File::create(&unified_log_path)
            .with_context(|| format!("create unified log {}", unified_log_path.display()))?;
    }

    let shutdown = install_shutdown_flag()?;
    follow_unified_log(&unified_log_path, &mut std::io::stdout(), &shutdown)
}

fn launch_warmup_supervisor(spec: &WarmupSpec, state_root: &Path, log_root: &Path) -> Result<()> {
    let config = SuperviseConfig {
        worker_command: spec.command.clone(),
        port: spec.port,
    };
    let encoded = supervisor::encode_config(&config)?;

    paths::ensure_log_dirs(log_root)?;
    let agent_log_path = paths::agent_log_path(log_root);
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&agent_log_path)
        .with_context(|| format!("open agent log {}", agent_log_path.display()))?;
    let stderr_file = log_file
        .try_clone()
        .context("cloning agent log handle for stderr")?;

    let exe = std::env::current_exe().context("resolving current executable for re-exec")?;
    let child = std::process::Command::new(exe)
        .arg("worker-supervisor")
        .arg("--root")
        .arg(state_root)
        .arg("--log-root")
        .arg(log_root)
        .arg("--worker-config-base64")
        .arg(encoded)
        .stdout(log_file)
        .stderr(stderr_file)
        .spawn()
        .with_context(|| format!("failed to start worker supervisor for port {}", spec.port))?;

    tracing::info!(
        worker_command = ?spec.command,
        worker_port = spec.port,
        pid = child.id(),
        "launched worker warmup supervisor"
    );
    Ok(())
}

/// Install a SIGTERM/SIGINT handler that flips a shared flag, mirroring
/// `signal.NotifyContext` in the Go source.
fn install_shutdown_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, flag.clone())
        .context("registering SIGTERM handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag.clone())
        .context("registering SIGINT handler")?;
    Ok(flag)
}

/// Tail `path` from EOF to `output` until `shutdown` is set, re-seeking to
/// the start if the file is truncated underneath us (log rotation).
fn follow_unified_log(path: &Path, output: &mut impl Write, shutdown: &AtomicBool) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    reader
        .get_mut()
        .seek(SeekFrom::End(0))
        .with_context(|| format!("seek {}", path.display()))?;
    let mut offset = reader
        .get_mut()
        .stream_position()
        .with_context(|| format!("tell {}", path.display()))?;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut line = Vec::new();
        let n = read_line_lossy(&mut reader, &mut line)?;
        if n > 0 {
            output.write_all(&line).ok();
            offset += n as u64;
        }

        if n == 0 || !line.ends_with(b"\n") {
            reset_if_truncated(&mut reader, &mut offset)?;
            if wait_or_shutdown(shutdown, EOF_WAIT) {
                return Ok(());
            }
        }
    }
}

fn read_line_lossy(reader: &mut impl BufRead, out: &mut Vec<u8>) -> Result<usize> {
    Ok(reader.read_until(b'\n', out)?)
}

fn reset_if_truncated(reader: &mut BufReader<File>, offset: &mut u64) -> Result<()> {
    let size = reader.get_ref().metadata()?.len();
    if size < *offset {
        // `BufReader::seek` discards any stale buffered bytes left over
        // from before the truncation.
        reader.seek(SeekFrom::Start(0))?;
        *offset = 0;
    }
    Ok(())
}

fn wait_or_shutdown(shutdown: &AtomicBool, duration: Duration) -> bool {
    let deadline = std::time::Instant::now() + duration;
    while std::time::Instant::now() < deadline {
        if shutdown.load(Ordering::SeqCst) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    shutdown.load(Ordering::SeqCst)
}
