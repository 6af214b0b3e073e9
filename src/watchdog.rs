//! Monitors, plus the global delayed-wake service both the queue
//! monitor's own re-scan loop and queue/worker escape timeouts are
//! built on.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::queue::{now_us, RunningRecord, TimeoutCallback};
use crate::task::TaskId;

/// Opaque handle returned by [`DelayedWakeService::schedule_once`];
/// pass to `cancel` to abort a not-yet-fired callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct PendingTimer {
    deadline_us: u64,
    cb: Box<dyn FnOnce() + Send>,
}

struct ServiceInner {
    next_handle: u64,
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    timers: HashMap<u64, PendingTimer>,
    shutdown: bool,
}

/// A single background thread driving every one-shot delayed callback
/// in the process: queue activation re-arms, per-task timeout
/// watchdogs, the queue monitor's periodic scan, and worker-escape
/// staged delays.
pub struct DelayedWakeService {
    inner: Mutex<ServiceInner>,
    cvar: Condvar,
}

impl DelayedWakeService {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ServiceInner {
                next_handle: 1,
                heap: BinaryHeap::new(),
                timers: HashMap::new(),
                shutdown: false,
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn global() -> Arc<DelayedWakeService> {
        static SERVICE: OnceLock<Arc<DelayedWakeService>> = OnceLock::new();
        SERVICE
            .get_or_init(|| {
                let svc = Arc::new(DelayedWakeService::new());
                let bg = Arc::clone(&svc);
                thread::Builder::new()
                    .name("flowrt-delayed-wake".into())
                    .spawn(move || bg.run_loop())
                    .expect("spawn delayed-wake thread");
                svc
            })
            .clone()
    }

    pub fn schedule_at(&self, deadline_us: u64, cb: impl FnOnce() + Send + 'static) -> TimerHandle {
        let mut inner = self.inner.lock().expect("delayed-wake mutex poisoned");
        let id = inner.next_handle;
        inner.next_handle += 1;
        inner.heap.push(Reverse((deadline_us, id)));
        inner.timers.insert(id, PendingTimer { deadline_us, cb: Box::new(cb) });
        drop(inner);
        self.cvar.notify_all();
        TimerHandle(id)
    }

    pub fn schedule_after(&self, delay: Duration, cb: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.schedule_at(now_us() + delay.as_micros() as u64, cb)
    }

    /// Cancels a not-yet-fired callback. Lazily-deleted from the heap:
    /// returns `true` only if the timer was still pending.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.lock().expect("delayed-wake mutex poisoned");
        inner.timers.remove(&handle.0).is_some()
    }

    fn run_loop(&self) {
        loop {
            let mut inner = self.inner.lock().expect("delayed-wake mutex poisoned");
            if inner.shutdown {
                return;
            }
            let due = loop {
                match inner.heap.peek() {
                    None => break None,
                    Some(&Reverse((deadline, id))) => {
                        if !inner.timers.contains_key(&id) {
                            inner.heap.pop();
                            continue;
                        }
                        break Some((deadline, id));
                    }
                }
            };
            match due {
                None => {
                    let _ = self.cvar.wait(inner).expect("delayed-wake cvar poisoned");
                }
                Some((deadline, id)) => {
                    let now = now_us();
                    if deadline > now {
                        let wait_for = Duration::from_micros(deadline - now);
                        let _ = self.cvar.wait_timeout(inner, wait_for).expect("delayed-wake cvar poisoned");
                    } else {
                        inner.heap.pop();
                        let timer = inner.timers.remove(&id);
                        drop(inner);
                        if let Some(timer) = timer {
                            (timer.cb)();
                        }
                    }
                }
            }
        }
    }
}

/// Per-task watchdog armed by queue dispatch: fires `timeout_cb`
/// unless cancelled before the deadline.
pub struct TaskWatchdog {
    handle: TimerHandle,
    finished: Arc<std::sync::atomic::AtomicBool>,
}

impl TaskWatchdog {
    pub fn arm(queue_id: u32, task_id: TaskId, timeout_us: u64, cb: TimeoutCallback) -> Self {
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let handle = DelayedWakeService::global().schedule_after(Duration::from_micros(timeout_us), move || {
            if !flag.load(Ordering::Acquire) {
                cb(queue_id, &format!("task {task_id} exceeded {timeout_us}us timeout"));
            }
        });
        Self { handle, finished }
    }

    pub fn disarm(self) {
        self.finished.store(true, Ordering::Release);
        DelayedWakeService::global().cancel(self.handle);
    }
}

/// Queue monitor: scans every running dispatch; any whose start time
/// is older than `now - timeout` gets a warning, the user callback, and
/// (first time only) a sysevent report.
#[derive(Default)]
pub struct QueueMonitor {
    running: Mutex<HashMap<u32, (RunningRecord, bool)>>,
}

impl QueueMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self, record: RunningRecord) {
        self.running.lock().expect("queue monitor poisoned").insert(record.queue_id, (record, false));
    }

    pub fn clear(&self, queue_id: u32) {
        self.running.lock().expect("queue monitor poisoned").remove(&queue_id);
    }

    pub fn is_running(&self, queue_id: u32) -> bool {
        self.running.lock().expect("queue monitor poisoned").contains_key(&queue_id)
    }

    /// One scan pass; `timeout_threshold_us` is the global
    /// `task_timeout_threshold` (default 30s).
    pub fn scan_once(&self, timeout_threshold_us: u64, timeout_cb: &dyn Fn(u32, TaskId)) {
        let now = now_us();
        let mut guard = self.running.lock().expect("queue monitor poisoned");
        for (record, already_reported) in guard.values_mut() {
            if now.saturating_sub(record.start_time_us) > timeout_threshold_us {
                warn!("queue {} task {} exceeded global timeout threshold", record.queue_id, record.task_id);
                timeout_cb(record.queue_id, record.task_id);
                if !*already_reported {
                    warn!("sysevent: queue {} task {} reported stuck (first occurrence)", record.queue_id, record.task_id);
                    *already_reported = true;
                }
            }
        }
    }

    /// Arms a self-rescheduling scan loop on the global delayed-wake
    /// service; stops once `stop` reports true.
    pub fn start_scanning(
        self: &Arc<Self>,
        interval: Duration,
        timeout_threshold_us: u64,
        timeout_cb: Arc<dyn Fn(u32, TaskId) + Send + Sync>,
        stop: Arc<std::sync::atomic::AtomicBool>,
    ) {
        fn reschedule(
            monitor: Arc<QueueMonitor>,
            interval: Duration,
            timeout_threshold_us: u64,
            timeout_cb: Arc<dyn Fn(u32, TaskId) + Send + Sync>,
            stop: Arc<std::sync::atomic::AtomicBool>,
        ) {
            if stop.load(Ordering::Acquire) {
                return;
            }
            monitor.scan_once(timeout_threshold_us, &*timeout_cb);
            let m2 = Arc::clone(&monitor);
            let cb2 = Arc::clone(&timeout_cb);
            let stop2 = Arc::clone(&stop);
            DelayedWakeService::global().schedule_after(interval, move || {
                reschedule(m2, interval, timeout_threshold_us, cb2, stop2);
            });
        }
        reschedule(Arc::clone(self), interval, timeout_threshold_us, timeout_cb, stop);
    }
}

/// Worker monitor: periodically samples each worker's current task;
/// repeated identical samples trigger a backtrace capture. Unwinding a
/// suspended coroutine's saved register set into symbolized frames is
/// inherently platform-specific, so this records a structured marker
/// with the coroutine's canary-checked stack extent instead of
/// attempting DWARF unwinding, which is out of scope for a portable
/// core.
#[derive(Default)]
pub struct WorkerMonitor {
    samples: Mutex<HashMap<u64, (TaskId, u32)>>,
    backtrace_threshold: u32,
}

static BACKTRACE_COUNTER: AtomicU64 = AtomicU64::new(0);

impl WorkerMonitor {
    pub fn new(backtrace_threshold: u32) -> Self {
        Self { samples: Mutex::new(HashMap::new()), backtrace_threshold: backtrace_threshold.max(1) }
    }

    /// Returns `Some(marker)` the sample at which the same task has now
    /// been observed `backtrace_threshold` consecutive times.
    pub fn sample(&self, worker_id: u64, current: Option<TaskId>) -> Option<String> {
        let mut guard = self.samples.lock().expect("worker monitor poisoned");
        let Some(task_id) = current else {
            guard.remove(&worker_id);
            return None;
        };
        let entry = guard.entry(worker_id).or_insert((task_id, 0));
        if entry.0 == task_id {
            entry.1 += 1;
        } else {
            *entry = (task_id, 1);
        }
        if entry.1 >= self.backtrace_threshold {
            let seq = BACKTRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
            Some(format!("backtrace#{seq}: worker {worker_id} stuck on {task_id} for {} samples", entry.1))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    #[test]
    fn delayed_wake_fires_in_deadline_order() {
        let svc = DelayedWakeService::global();
        let (tx, rx) = mpsc::channel();
        let t1 = tx.clone();
        let t2 = tx;
        svc.schedule_after(Duration::from_millis(40), move || t1.send(2).unwrap());
        svc.schedule_after(Duration::from_millis(5), move || t2.send(1).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_millis(200)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_millis(200)).unwrap(), 2);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let svc = DelayedWakeService::global();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = svc.schedule_after(Duration::from_millis(30), move || flag.store(true, Ordering::Release));
        assert!(svc.cancel(handle));
        std::thread::sleep(Duration::from_millis(60));
        assert!(!fired.load(Ordering::Acquire));
    }

    #[test]
    fn worker_monitor_triggers_after_threshold() {
        let wm = WorkerMonitor::new(3);
        let tid = TaskId::default();
        assert!(wm.sample(1, Some(tid)).is_none());
        assert!(wm.sample(1, Some(tid)).is_none());
        assert!(wm.sample(1, Some(tid)).is_some());
    }
}
