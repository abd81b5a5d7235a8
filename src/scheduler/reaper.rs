//! Child-process bookkeeping: `fork_with_reap` plus the lazily-started
//! reaper thread that waits out exited children so they never linger as
//! zombies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{SchedError, SchedResult};

/// Fallback ceiling used when the OS reports a non-positive soft limit.
const FALLBACK_NPROC_LIMIT: u32 = 127_000;

pub(crate) struct Reaper {
    pids: Mutex<Vec<libc::pid_t>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Reaper {
    pub(crate) fn new() -> Self {
        Self { pids: Mutex::new(Vec::new()), thread: Mutex::new(None), started: AtomicBool::new(false) }
    }

    /// Fork a child process, starting the reaper thread on first use.
    /// Returns the parent-side pid (0 in the child, matching `fork(2)`).
    pub(crate) fn fork_with_reap(self: &Arc<Self>, _desc: &str) -> SchedResult<libc::pid_t> {
        self.ensure_started();

        // SAFETY: fork() is async-signal-safe to call; the only work done
        // between fork and exec/exit in the child is the caller's, not ours.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(SchedError::ForkFailed(std::io::Error::last_os_error()));
        }
        if pid > 0 {
            self.pids.lock().push(pid);
        }
        Ok(pid)
    }

    fn ensure_started(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        block_sigchld();
        let reaper = self.clone();
        // The reaper thread only ever outlives the process, per the
        // governing specification's shutdown design (§5): it is
        // deliberately not joined by `Scheduler::stop()`.
        let handle = std::thread::Builder::new().name("reaper".into()).spawn(move || {
            reaper.reaper_loop();
        });
        match handle {
            Ok(h) => *self.thread.lock() = Some(h),
            Err(e) => warn!(error = %e, "failed to spawn reaper thread; children will not be reaped"),
        }
    }

    fn reaper_loop(&self) {
        loop {
            wait_for_sigchld();
            self.reap_once();
        }
    }

    fn reap_once(&self) {
        let mut pids = self.pids.lock();
        pids.retain(|&pid| {
            let mut status: libc::c_int = 0;
            // SAFETY: pid is a value we obtained from a prior successful fork().
            let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if rc == 0 {
                true // still running
            } else if rc == pid {
                info!(pid, status, "reaped child process");
                false
            } else {
                // rc < 0: ECHILD or similar; drop it, nothing more we can do.
                false
            }
        });
    }
}

#[cfg(target_os = "linux")]
fn block_sigchld() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGCHLD);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

#[cfg(not(target_os = "linux"))]
fn block_sigchld() {}

#[cfg(target_os = "linux")]
fn wait_for_sigchld() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGCHLD);
        let mut sig: libc::c_int = 0;
        libc::sigwait(&set, &mut sig);
    }
}

#[cfg(not(target_os = "linux"))]
fn wait_for_sigchld() {
    // Portability fallback: `sigwait` semantics for SIGCHLD are unreliable
    // outside Linux in this codebase's experience, so poll instead.
    std::thread::sleep(std::time::Duration::from_secs(1));
}

/// Clamp a configured `workers_max` to the OS thread/process ceiling,
/// raising the soft `RLIMIT_NPROC` limit to the hard limit first if room
/// allows, as the original scheduler's constructor does.
#[cfg(target_os = "linux")]
pub(crate) fn nproc_ceiling() -> u32 {
    unsafe {
        let mut lim: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NPROC, &mut lim) != 0 {
            return FALLBACK_NPROC_LIMIT;
        }
        if lim.rlim_cur < lim.rlim_max {
            let mut raised = lim;
            raised.rlim_cur = lim.rlim_max;
            let _ = libc::setrlimit(libc::RLIMIT_NPROC, &raised);
            if libc::getrlimit(libc::RLIMIT_NPROC, &mut lim) != 0 {
                return FALLBACK_NPROC_LIMIT;
            }
        }
        if lim.rlim_cur == 0 || lim.rlim_cur == libc::RLIM_INFINITY as libc::rlim_t {
            FALLBACK_NPROC_LIMIT
        } else {
            lim.rlim_cur.min(u32::MAX as libc::rlim_t) as u32
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn nproc_ceiling() -> u32 {
    FALLBACK_NPROC_LIMIT
}
