//! Zombie Reaper (§4.A), mandated by PID-1 responsibility.
//!
//! Grounded on `internal/reaper/reaper.go`: install a SIGCHLD handler plus
//! a periodic (10 ms) ticker, both triggering a non-blocking `waitpid(-1,
//! ..., WNOHANG)` loop; a process-wide flag gates whether reaping is
//! *active* versus merely *installed*, so child `run-job`/`worker-supervisor`
//! invocations — which explicitly wait on their own children — don't race
//! the background reaper for the same wait slot. `signal-hook` supplies the
//! portable SIGCHLD registration; the teacher has no signal-handling
//! dependency of its own, so this is a pack enrichment (see DESIGN.md).

use anyhow::{Context, Result};
use signal_hook::consts::SIGCHLD;
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Once, OnceLock};
use std::time::Duration;

static ACTIVE: AtomicBool = AtomicBool::new(false);
static INSTALLED: Once = Once::new();
static INSTALL_ERROR: OnceLock<String> = OnceLock::new();

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Install the reaper's signal handler and background poll thread.
///
/// Idempotent: subsequent calls are no-ops. Reaping is installed but
/// inactive until [`enable`] is called — only the PID-1 `start`
/// invocation should do that.
pub fn install() -> Result<()> {
    INSTALLED.call_once(|| match Signals::new([SIGCHLD]) {
        Ok(mut signals) => {
            std::thread::spawn(move || {
                for _ in signals.forever() {
                    reap_zombies();
                }
            });
            std::thread::spawn(|| loop {
                reap_zombies();
                std::thread::sleep(POLL_INTERVAL);
            });
        }
        Err(e) => {
            let _ = INSTALL_ERROR.set(e.to_string());
        }
    });

    if let Some(e) = INSTALL_ERROR.get() {
        anyhow::bail!("{e}");
    }
    Ok(())
}

/// Enable active reaping. Call this only in the PID-1 `start` process
/// (§4.A "the reaper is installed but a guard variable disables its
/// active reaping" in every other invocation).
pub fn enable() {
    ACTIVE.store(true, Ordering::SeqCst);
}

pub fn is_active() -> bool {
    ACTIVE.load(Ordering::SeqCst)
}

fn reap_zombies() {
    if !ACTIVE.load(Ordering::SeqCst) {
        return;
    }
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: waitpid with WNOHANG is non-blocking and safe to call
        // repeatedly; a negative/zero return means "nothing more to reap".
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
    }
}

/// Install the reaper and immediately enable active reaping.
///
/// Convenience for the PID-1 `start` entrypoint; fails fatally per §4.A
/// ("inability to install the signal handler is fatal only for the PID-1
/// process").
pub fn install_and_enable() -> Result<()> {
    install().context("installing PID-1 zombie reaper")?;
    enable();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn reap_zombies_is_a_no_op_while_inactive() {
        ACTIVE.store(false, Ordering::SeqCst);
        // Must not panic and must not hang even with no children.
        reap_zombies();
    }

    #[test]
    fn active_reaper_collects_a_short_lived_child() {
        let child = Command::new("true")
            .spawn()
            .expect("spawn short-lived child");
        let pid = child.id() as libc::pid_t;
        // Deliberately drop our `Child` handle without waiting on it, so the
        // only collector left is the reaper's own raw `waitpid`.
        drop(child);

        ACTIVE.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        reap_zombies();

        // The child has already been reaped; asking the kernel about it
        // again must report "no such process", not a lingering zombie.
        let alive = unsafe { libc::kill(pid, 0) == 0 };
        ACTIVE.store(false, Ordering::SeqCst);
        assert!(!alive, "child pid {pid} still resolves after reaping");
    }
}
