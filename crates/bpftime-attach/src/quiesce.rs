//! Stop-the-world quiescence primitive for safe prologue patching.
//!
//! No off-the-shelf `detour`/`retour`/`minhook`-style crate is pulled in
//! for this; it combines `nix`'s `signal`/`process` features for
//! per-thread suspend/resume with a hand-rolled ticket lock so suspension
//! is FIFO-fair and concurrent installers can't starve each other.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use once_cell::sync::Lazy;

/// A ticket lock: tickets are served strictly in acquisition order, so no
/// installer thread can be starved by later arrivals (the attach protocol
/// FIFO-fairness requirement — a plain spinlock or `parking_lot::Mutex`
/// does not guarantee this).
pub struct FifoLock {
    next_ticket: AtomicU64,
    now_serving: AtomicU64,
}

impl Default for FifoLock {
    fn default() -> Self {
        FifoLock { next_ticket: AtomicU64::new(0), now_serving: AtomicU64::new(0) }
    }
}

impl FifoLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> FifoGuard<'_> {
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            std::hint::spin_loop();
        }
        FifoGuard { lock: self }
    }
}

pub struct FifoGuard<'a> {
    lock: &'a FifoLock,
}

impl Drop for FifoGuard<'_> {
    fn drop(&mut self) {
        self.lock.now_serving.fetch_add(1, Ordering::Release);
    }
}

fn current_tid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

fn other_thread_ids() -> std::io::Result<Vec<i32>> {
    let me = current_tid();
    let mut out = Vec::new();
    for entry in fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            if tid != me {
                out.push(tid);
            }
        }
    }
    Ok(out)
}

/// Thread-directed signal delivery (`tgkill`); `nix::sys::signal::kill`
/// only targets whole processes/process-groups, not individual threads.
fn tgkill(tid: i32, sig: Signal) -> std::io::Result<()> {
    let pid = unsafe { libc::getpid() };
    let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, sig as i32) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// `true` once `/proc/self/task/<tid>/stat`'s state field reads `T`
/// (stopped).
fn thread_is_stopped(tid: i32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/self/task/{tid}/stat")) else {
        // Thread has already exited; treat as quiesced.
        return true;
    };
    // Field 3 is the state character, but field 2 (comm) is parenthesized
    // and may itself contain spaces, so find the state after the closing
    // paren rather than splitting naively.
    stat.rsplit_once(')').map(|(_, rest)| rest.trim_start().starts_with('T')).unwrap_or(false)
}

const STOP_TIMEOUT: Duration = Duration::from_millis(200);

/// Process-wide installation lock: every call to [`with_quiescence`] takes a
/// ticket here first, so concurrent installers suspend the rest of the
/// process one at a time, in strict arrival order (the attach protocol's
/// "the manager serializes installation across threads" / "Suspension must
/// be FIFO-fair to prevent livelock between concurrent installers").
static INSTALL_LOCK: Lazy<FifoLock> = Lazy::new(FifoLock::new);

/// Suspend every other thread in the process, run `f`, then resume them —
/// regardless of whether `f` panics. Serialized process-wide against other
/// concurrent callers via [`INSTALL_LOCK`].
///
/// This is the back-end's "quiescence primitive" (the attach protocol): a
/// stop-the-world-equivalent over the process, used while overwriting a
/// target's prologue bytes so no thread is ever observed mid-patch.
pub fn with_quiescence<R>(f: impl FnOnce() -> R) -> R {
    let _ticket = INSTALL_LOCK.lock();
    let threads = other_thread_ids().unwrap_or_default();
    for &tid in &threads {
        let _ = tgkill(tid, Signal::SIGSTOP);
    }
    let deadline = Instant::now() + STOP_TIMEOUT;
    for &tid in &threads {
        while !thread_is_stopped(tid) && Instant::now() < deadline {
            std::thread::yield_now();
        }
    }

    struct ResumeOnDrop<'a>(&'a [i32]);
    impl Drop for ResumeOnDrop<'_> {
        fn drop(&mut self) {
            for &tid in self.0 {
                let _ = tgkill(tid, Signal::SIGCONT);
            }
        }
    }
    let _resume = ResumeOnDrop(&threads);

    f()
}

/// Exposed for callers that want to confirm the current process can
/// enumerate its own threads (used by the manager's self-test and by
/// diagnostics); not part of the installation path itself.
pub fn thread_count() -> usize {
    other_thread_ids().map(|v| v.len() + 1).unwrap_or(1)
}

#[allow(dead_code)]
fn pid_for_display() -> Pid {
    Pid::this()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_lock_serves_two_threads_without_deadlock() {
        let lock = Arc::new(FifoLock::new());
        let l2 = lock.clone();
        let counter = Arc::new(AtomicU64::new(0));
        let c2 = counter.clone();
        let handle = std::thread::spawn(move || {
            let _g = l2.lock();
            c2.fetch_add(1, Ordering::SeqCst);
        });
        {
            let _g = lock.lock();
            counter.fetch_add(1, Ordering::SeqCst);
        }
        handle.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn with_quiescence_runs_the_closure_and_returns_its_value() {
        let result = with_quiescence(|| 1 + 1);
        assert_eq!(result, 2);
    }
}
