use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicPtr, Ordering};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, write};

use crate::notify::{CompletionRecord, CompletionSender, ELAPSED_UNKNOWN};
use crate::timing::{TimerRegistry, monotonic_millis};

/// State the SIGCHLD handler works over: the timer registry shared with
/// the launcher and the write end of the completion channel. Built once
/// at startup and handed to the handler through [`install`]; everything
/// else holds it by reference.
pub struct ReaperState {
    pub registry: TimerRegistry,
    sender: CompletionSender,
}

/// Bridge to signal context. Only [`install`] stores here; the handler
/// loads with Acquire so it sees a fully initialized state or null.
static HANDLER_STATE: AtomicPtr<ReaperState> = AtomicPtr::new(std::ptr::null_mut());

impl ReaperState {
    pub fn new(sender: CompletionSender) -> Self {
        Self {
            registry: TimerRegistry::new(),
            sender,
        }
    }

    /// Collect every currently-reapable child and emit one record each.
    ///
    /// Runs inside the SIGCHLD handler, so it sticks to the
    /// async-signal-safe subset: waitpid, clock_gettime, write, atomics.
    /// One signal delivery can stand for several terminations, hence the
    /// drain loop. Nothing outside this function calls waitpid.
    pub fn reap_pending(&self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, _)) => self.emit(pid, false),
                Ok(WaitStatus::Signaled(pid, _, _)) => self.emit(pid, true),
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }

    fn emit(&self, pid: Pid, signaled: bool) {
        let record = match self.registry.take(pid) {
            Some(entry) => CompletionRecord {
                pid: pid.as_raw(),
                elapsed_millis: if signaled {
                    0
                } else {
                    monotonic_millis().saturating_sub(entry.started_at) as i64
                },
                background: entry.background,
                signaled,
            },
            // Reaped before the registration was published.
            None => CompletionRecord {
                pid: pid.as_raw(),
                elapsed_millis: ELAPSED_UNKNOWN,
                background: false,
                signaled,
            },
        };
        if self.sender.send(&record).is_err() {
            // No recovery exists in signal context, and a lost record
            // would hang a foreground wait forever.
            fatal(b"chronosh: completion channel write failed\n");
        }
    }
}

fn fatal(message: &[u8]) -> ! {
    let stderr = unsafe { BorrowedFd::borrow_raw(libc::STDERR_FILENO) };
    let _ = write(stderr, message);
    unsafe { libc::_exit(1) }
}

extern "C" fn on_sigchld(_signal: libc::c_int) {
    let saved_errno = Errno::last_raw();
    let state = HANDLER_STATE.load(Ordering::Acquire);
    if let Some(state) = unsafe { state.as_ref() } {
        state.reap_pending();
    }
    Errno::set_raw(saved_errno);
}

/// Install the SIGCHLD handler over `state`.
///
/// Call once at startup, before the first launch. `state` must live for
/// the rest of the process; the shell leaks one on construction.
/// SA_RESTART keeps the line editor's blocking reads transparent to
/// reaping, and SA_NOCLDSTOP mutes the stop/continue notifications the
/// reaper has no use for.
pub fn install(state: &'static ReaperState) -> Result<()> {
    HANDLER_STATE.store(
        std::ptr::from_ref(state).cast_mut(),
        Ordering::Release,
    );
    let action = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &action) }
        .context("SIGCHLD handler installation failed")?;
    Ok(())
}

/// Shield the shell itself from Ctrl-C. Foreground children restore the
/// default disposition before exec, so the keystroke still reaches them.
pub fn ignore_sigint() -> Result<()> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGINT, &action) }.context("ignoring SIGINT failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify;
    use nix::sys::signal::kill;
    use nix::unistd::{ForkResult, fork};
    use std::thread::sleep;
    use std::time::Duration;

    fn spawn_exiting_child() -> Pid {
        match unsafe { fork() }.expect("fork") {
            ForkResult::Parent { child } => child,
            // The test harness is threaded; nothing but _exit may run here.
            ForkResult::Child => unsafe { libc::_exit(0) },
        }
    }

    fn spawn_pausing_child() -> Pid {
        match unsafe { fork() }.expect("fork") {
            ForkResult::Parent { child } => child,
            ForkResult::Child => loop {
                unsafe {
                    libc::pause();
                }
            },
        }
    }

    // Single test so it owns every child in this binary: the drain waits
    // on any pid, and concurrent forking tests would steal each other's
    // children.
    #[test]
    fn drain_covers_timed_unregistered_and_killed_children() -> Result<()> {
        let (tx, mut rx) = notify::channel()?;
        let state = ReaperState::new(tx);

        let timed = spawn_exiting_child();
        assert!(state.registry.register(timed, false));

        let unregistered = spawn_exiting_child();

        let killed = spawn_pausing_child();
        assert!(state.registry.register(killed, true));
        kill(killed, Signal::SIGKILL)?;

        sleep(Duration::from_millis(200));
        state.reap_pending();

        let mut records = Vec::new();
        while let Some(record) = rx.try_next()? {
            records.push(record);
        }
        assert_eq!(records.len(), 3);

        let timed_rec = records
            .iter()
            .find(|r| r.pid == timed.as_raw())
            .expect("timed child reported");
        assert!(timed_rec.elapsed_millis >= 0);
        assert!(!timed_rec.signaled);
        assert!(!timed_rec.background);

        let sentinel = records
            .iter()
            .find(|r| r.pid == unregistered.as_raw())
            .expect("unregistered child reported");
        assert_eq!(sentinel.elapsed_millis, notify::ELAPSED_UNKNOWN);

        let killed_rec = records
            .iter()
            .find(|r| r.pid == killed.as_raw())
            .expect("killed child reported");
        assert!(killed_rec.signaled);
        assert_eq!(killed_rec.elapsed_millis, 0);
        assert!(killed_rec.background);

        // Registry is clean afterwards.
        assert_eq!(state.registry.take(timed), None);
        assert_eq!(state.registry.take(killed), None);
        Ok(())
    }
}
