use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use nix::time::{ClockId, clock_gettime};
use nix::unistd::Pid;

/// Upper bound on concurrently tracked jobs. Launches beyond it still run,
/// they just complete without a timing report.
pub const REGISTRY_CAPACITY: usize = 64;

const FREE: i32 = 0;
const CLAIMED: i32 = -1;

/// Timer data removed from the registry when a child is reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    pub started_at: u64,
    pub background: bool,
}

struct TimerSlot {
    pid: AtomicI32,
    started_at: AtomicU64,
    background: AtomicBool,
}

impl TimerSlot {
    fn new() -> Self {
        Self {
            pid: AtomicI32::new(FREE),
            started_at: AtomicU64::new(0),
            background: AtomicBool::new(false),
        }
    }
}

/// Fixed-capacity table of in-flight job timers.
///
/// `register` runs in normal control flow; `take` also runs inside the
/// SIGCHLD handler, which can preempt `register` between any two
/// instructions. Every operation is therefore a lock-free walk over
/// atomic slots, and nothing on either path allocates. A slot is
/// published (pid store, Release) only after its stamp and flag are in
/// place, so an Acquire load of a matching pid always observes a fully
/// built entry, never a torn one.
pub struct TimerRegistry {
    slots: [TimerSlot; REGISTRY_CAPACITY],
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| TimerSlot::new()),
        }
    }

    /// Start timing `pid`. Returns false when every slot is occupied.
    pub fn register(&self, pid: Pid, background: bool) -> bool {
        for slot in &self.slots {
            if slot
                .pid
                .compare_exchange(FREE, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.started_at.store(monotonic_millis(), Ordering::Relaxed);
                slot.background.store(background, Ordering::Relaxed);
                slot.pid.store(pid.as_raw(), Ordering::Release);
                return true;
            }
        }
        false
    }

    /// Remove and return the entry for `pid`, if one was registered.
    ///
    /// `None` is a legitimate outcome: the child may have been reaped
    /// before the launcher's registration became visible.
    pub fn take(&self, pid: Pid) -> Option<TimerEntry> {
        let raw = pid.as_raw();
        for slot in &self.slots {
            if slot.pid.load(Ordering::Acquire) == raw {
                let entry = TimerEntry {
                    started_at: slot.started_at.load(Ordering::Relaxed),
                    background: slot.background.load(Ordering::Relaxed),
                };
                slot.pid.store(FREE, Ordering::Release);
                return Some(entry);
            }
        }
        None
    }
}

/// Milliseconds on the monotonic clock. CLOCK_MONOTONIC reads are in the
/// async-signal-safe set, so this is callable from the reaper.
pub fn monotonic_millis() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1000 + ts.tv_nsec() as u64 / 1_000_000)
        .unwrap_or(0)
}
