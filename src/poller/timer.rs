//! Poller-local timer map.
//!
//! Distinct from `watchdog::DelayedWakeService`: these timers fire
//! inline inside whichever thread is running `PollOnce`, not on a
//! dedicated background thread, because their whole point is to fold
//! into the same `epoll_wait` timeout computation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

pub type TimerCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Executing,
    Executed,
}

struct TimerEntry {
    deadline_us: u64,
    cb: std::sync::Arc<TimerCallback>,
    repeat: bool,
    interval_us: u64,
}

/// One timer map, normally owned by a single [`crate::poller::Poller`].
pub struct TimerMap {
    next_handle: AtomicU64,
    entries: Mutex<BTreeMap<(u64, u64), TimerEntry>>,
    exec_state: Mutex<HashMap<u64, ExecState>>,
    cvar: Condvar,
}

impl Default for TimerMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerMap {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            entries: Mutex::new(BTreeMap::new()),
            exec_state: Mutex::new(HashMap::new()),
            cvar: Condvar::new(),
        }
    }

    /// `RegisterTimer`: mutex-guarded insert; callers should wake a
    /// blocked poller if the new deadline is sooner than the prior
    /// head (checked via `next_deadline` before/after).
    pub fn register(&self, deadline_us: u64, cb: TimerCallback, repeat: bool, interval_us: u64) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().expect("timer map poisoned");
        entries.insert((deadline_us, handle), TimerEntry { deadline_us, cb: std::sync::Arc::new(cb), repeat, interval_us });
        handle
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.lock().expect("timer map poisoned").keys().next().map(|&(d, _)| d)
    }

    /// `UnregisterTimer`: if the handle is mid-callback, block until it
    /// finishes (`EXECUTING -> EXECUTED`) to avoid use-after-free of the
    /// callback's captured state; otherwise remove it directly.
    pub fn unregister(&self, handle: u64) -> bool {
        {
            let mut entries = self.entries.lock().expect("timer map poisoned");
            let key = entries.keys().find(|&&(_, h)| h == handle).copied();
            if let Some(key) = key {
                entries.remove(&key);
                return true;
            }
        }
        let mut state = self.exec_state.lock().expect("timer exec state poisoned");
        loop {
            match state.get(&handle) {
                Some(ExecState::Executing) => {
                    state = self.cvar.wait(state).expect("timer cvar poisoned");
                }
                Some(ExecState::Executed) | None => return false,
            }
        }
    }

    /// Pop and run every timer due at or before `now_us`, rescheduling
    /// repeating ones. Returns how many fired (caller uses this to
    /// decide `RET_TIMER` vs. continuing to `epoll_wait`).
    pub fn run_due(&self, now_us: u64) -> usize {
        let due: Vec<((u64, u64), TimerEntry)> = {
            let mut entries = self.entries.lock().expect("timer map poisoned");
            let due_keys: Vec<(u64, u64)> = entries.range(..=(now_us, u64::MAX)).map(|(&k, _)| k).collect();
            due_keys.into_iter().filter_map(|k| entries.remove(&k).map(|v| (k, v))).collect()
        };
        let count = due.len();
        for ((_, handle), entry) in due {
            self.exec_state.lock().expect("timer exec state poisoned").insert(handle, ExecState::Executing);
            (entry.cb)();
            {
                let mut state = self.exec_state.lock().expect("timer exec state poisoned");
                state.insert(handle, ExecState::Executed);
            }
            self.cvar.notify_all();
            if entry.repeat {
                let next_deadline = now_us + entry.interval_us;
                self.entries.lock().expect("timer map poisoned").insert(
                    (next_deadline, handle),
                    TimerEntry { deadline_us: next_deadline, cb: entry.cb, repeat: true, interval_us: entry.interval_us },
                );
            }
        }
        count
    }
}
