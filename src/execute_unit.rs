//! Execute unit: process-wide singleton wiring the scheduler, QoS
//! monitor, worker manager and (through `runtime.rs`) the queue/loop
//! layer together from one `ExecuteUnit::new`.
//!
//! `BindTG`/`UnbindTG`, `SetWorkerStackSize`, `SetEscapeEnable`,
//! `NotifyWorkers` are the public surface; joining the RTG (Related
//! Thread Group) itself is an opaque cgroup-attribute operation,
//! represented here as a single trait method a caller may override.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::{EscapeStages, RuntimeConfig};
use crate::error::FlowrtResult;
use crate::monitor::QosMonitor;
use crate::qos::{PerQos, QoS};
use crate::sched::Scheduler;
use crate::watchdog::{DelayedWakeService, QueueMonitor, WorkerMonitor};
use crate::worker::WorkerManager;

/// Opaque cgroup/RTG join operation the worker invokes at thread
/// start. The default no-op implementation is correct on any platform
/// without a thread-group scheduling facility; a caller on a system
/// that has one supplies its own.
pub trait ThreadGroupBinder: Send + Sync {
    fn bind(&self, qos: QoS);
    fn unbind(&self, qos: QoS);
}

pub struct NoopThreadGroupBinder;

impl ThreadGroupBinder for NoopThreadGroupBinder {
    fn bind(&self, _qos: QoS) {}
    fn unbind(&self, _qos: QoS) {}
}

/// Reference-counted RTG membership per QoS: the first `bind_tg` call
/// actually joins the group; the last matching `unbind_tg` leaves it.
struct ThreadGroupState {
    ref_count: AtomicUsize,
}

impl ThreadGroupState {
    fn new() -> Self {
        Self { ref_count: AtomicUsize::new(0) }
    }
}

/// Process-wide runtime singleton: owns the scheduler, QoS monitor,
/// worker manager, and monitors, and drives coordinated teardown
/// across all of them.
pub struct ExecuteUnit {
    pub config: Arc<RuntimeConfig>,
    pub scheduler: Arc<Scheduler>,
    pub monitor: Arc<QosMonitor>,
    pub workers: Arc<WorkerManager>,
    pub queue_monitor: Arc<QueueMonitor>,
    pub worker_monitor: Arc<WorkerMonitor>,
    tg_state: PerQos<ThreadGroupState>,
    tg_binder: Box<dyn ThreadGroupBinder>,
    queue_monitor_stop: Arc<std::sync::atomic::AtomicBool>,
    worker_monitor_stop: Arc<std::sync::atomic::AtomicBool>,
}

impl ExecuteUnit {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Self::with_thread_group_binder(config, Box::new(NoopThreadGroupBinder))
    }

    pub fn with_thread_group_binder(config: RuntimeConfig, tg_binder: Box<dyn ThreadGroupBinder>) -> Arc<Self> {
        let config = Arc::new(config);
        let scheduler = Arc::new(Scheduler::new());
        let monitor = Arc::new(QosMonitor::new(&config));
        let workers = WorkerManager::new(Arc::clone(&scheduler), Arc::clone(&monitor), Arc::clone(&config));
        let queue_monitor = Arc::new(QueueMonitor::new());
        let worker_monitor = Arc::new(WorkerMonitor::new(3));

        Arc::new(Self {
            config,
            scheduler,
            monitor,
            workers,
            queue_monitor,
            worker_monitor,
            tg_state: PerQos::from_fn(|_| ThreadGroupState::new()),
            tg_binder,
            queue_monitor_stop: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            worker_monitor_stop: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    /// Initialize/join the RTG for `qos` on demand, reference-counted
    /// so nested binds/unbinds balance.
    pub fn bind_tg(&self, qos: QoS) {
        let state = self.tg_state.get(qos);
        if state.ref_count.fetch_add(1, Ordering::AcqRel) == 0 {
            self.tg_binder.bind(qos);
        }
    }

    /// `UnbindTG(qos)`.
    pub fn unbind_tg(&self, qos: QoS) {
        let state = self.tg_state.get(qos);
        if state.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tg_binder.unbind(qos);
        }
    }

    pub fn set_worker_stack_size(&self, qos: QoS, bytes: usize) -> FlowrtResult<()> {
        self.workers.set_worker_stack_size(qos, bytes)
    }

    pub fn set_escape_enable(&self, stages: EscapeStages) -> FlowrtResult<()> {
        self.monitor.set_escape_enable(stages)
    }

    /// Synchronous wake + spawn up to `n`.
    pub fn notify_workers(&self, qos: QoS, n: usize) {
        self.workers.notify_workers(qos, n);
    }

    /// Starts the queue monitor's periodic scan loop. `timeout_cb` is
    /// invoked with `(queue_id, task_id)` for any dispatch whose start
    /// timestamp exceeds the global threshold.
    pub fn start_queue_monitor(self: &Arc<Self>, timeout_cb: Arc<dyn Fn(u32, crate::task::TaskId) + Send + Sync>) {
        let interval = Duration::from_millis(500);
        self.queue_monitor.start_scanning(
            interval,
            self.config.task_timeout_threshold.as_micros() as u64,
            timeout_cb,
            Arc::clone(&self.queue_monitor_stop),
        );
    }

    /// Starts the worker monitor's periodic sampling loop: every
    /// `interval`, snapshots every live worker's currently dispatched
    /// task (see [`crate::worker::thread::snapshot_worker_tasks`]) and
    /// feeds it through [`WorkerMonitor::sample`], logging any backtrace
    /// marker a sustained same-task run of samples produces. Mirrors
    /// [`Self::start_queue_monitor`]'s self-rescheduling shape.
    pub fn start_worker_monitor(self: &Arc<Self>, interval: Duration) {
        fn reschedule(monitor: Arc<WorkerMonitor>, interval: Duration, stop: Arc<std::sync::atomic::AtomicBool>) {
            if stop.load(Ordering::Acquire) {
                return;
            }
            for (worker_id, current) in crate::worker::thread::snapshot_worker_tasks() {
                if let Some(marker) = monitor.sample(worker_id, current) {
                    log::warn!("{marker}");
                }
            }
            let m2 = Arc::clone(&monitor);
            let stop2 = Arc::clone(&stop);
            DelayedWakeService::global().schedule_after(interval, move || {
                reschedule(m2, interval, stop2);
            });
        }
        reschedule(Arc::clone(&self.worker_monitor), interval, Arc::clone(&self.worker_monitor_stop));
    }

    /// Drives process-wide teardown: flips the scheduler's
    /// tearing-down flag, wakes every worker/poller so idle loops notice
    /// promptly, then joins every worker thread with a bounded timeout,
    /// logging if any remain.
    pub fn teardown(&self, join_timeout: Duration) {
        self.queue_monitor_stop.store(true, Ordering::Release);
        self.worker_monitor_stop.store(true, Ordering::Release);
        self.scheduler.begin_teardown();
        self.workers.begin_teardown();
        self.workers.join_all(join_timeout);
        for qos in QoS::iter_all() {
            if self.monitor.group(qos).total() != 0 {
                log::warn!("qos {qos} left {} worker(s) running past teardown timeout", self.monitor.group(qos).total());
            }
        }
    }
}

/// Process-wide lazily-initialized handle, matching
/// [`crate::watchdog::DelayedWakeService::global`] and
/// [`crate::coroutine::stack::StackSlab`]'s `OnceLock` pattern.
/// `Runtime` (`runtime.rs`) normally owns its own `Arc<ExecuteUnit>`
/// directly rather than going through this global; it exists for
/// callers that want a single ambient runtime per process. Like the
/// other process singletons, it lives for the remainder of the process
/// and is never torn down explicitly.
pub fn global() -> Arc<ExecuteUnit> {
    static INSTANCE: OnceLock<Arc<ExecuteUnit>> = OnceLock::new();
    Arc::clone(INSTANCE.get_or_init(|| ExecuteUnit::new(RuntimeConfig::from_env_and_file())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_unbind_tg_is_reference_counted() {
        struct Counting(Arc<AtomicUsize>);
        impl ThreadGroupBinder for Counting {
            fn bind(&self, _qos: QoS) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn unbind(&self, _qos: QoS) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }
        let joins = Arc::new(AtomicUsize::new(0));
        let unit = ExecuteUnit::with_thread_group_binder(RuntimeConfig::default(), Box::new(Counting(Arc::clone(&joins))));
        unit.bind_tg(QoS::Default);
        unit.bind_tg(QoS::Default);
        assert_eq!(joins.load(Ordering::SeqCst), 1);
        unit.unbind_tg(QoS::Default);
        assert_eq!(joins.load(Ordering::SeqCst), 1);
        unit.unbind_tg(QoS::Default);
        assert_eq!(joins.load(Ordering::SeqCst), 0);
        unit.teardown(Duration::from_secs(1));
    }

    #[test]
    fn worker_monitor_samples_a_genuinely_busy_worker() {
        use crate::task::{NormalTask, Task};
        use std::sync::atomic::AtomicBool;

        let unit = ExecuteUnit::new(RuntimeConfig::default());
        unit.start_worker_monitor(Duration::from_millis(20));

        let release = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&release);
        let task = NormalTask::spawn(QoS::Default, None, None, Box::new(move || {
            while !r.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(5));
            }
        }));
        unit.scheduler.wakeup(QoS::Default, Task::Normal(task), &unit.monitor);
        unit.workers.notify_workers(QoS::Default, 1);

        // Give the monitor several sampling passes to observe the same
        // worker pinned on the same task.
        std::thread::sleep(Duration::from_millis(150));
        let snapshot = crate::worker::thread::snapshot_worker_tasks();
        assert!(snapshot.iter().any(|(_, t)| t.is_some()), "worker monitor must observe at least one busy worker");

        release.store(true, Ordering::Release);
        unit.teardown(Duration::from_secs(1));
    }

    #[test]
    fn set_worker_stack_size_delegates_to_workers() {
        let unit = ExecuteUnit::new(RuntimeConfig::default());
        assert!(unit.set_worker_stack_size(QoS::Default, 256 * 1024).is_ok());
        unit.teardown(Duration::from_secs(1));
    }

    #[test]
    fn teardown_joins_spawned_workers() {
        let unit = ExecuteUnit::new(RuntimeConfig::default());
        unit.notify_workers(QoS::Default, 2);
        std::thread::sleep(Duration::from_millis(30));
        unit.teardown(Duration::from_secs(2));
        assert_eq!(unit.monitor.group(QoS::Default).total(), 0);
    }
}
