//! CPU worker manager: owns every worker OS thread, grouped per QoS,
//! and is the sole implementor of [`NotifyActionSink`] — the only
//! component with the resources (`std::thread::spawn`, a per-QoS
//! [`Poller`]) to act on the QoS monitor's wake/spawn/poll decisions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::error::{FlowrtError, FlowrtResult};
use crate::monitor::{NotifyAction, NotifyActionSink, QosMonitor};
use crate::poller::Poller;
use crate::qos::{PerQos, QoS};
use crate::sched::Scheduler;
use crate::watchdog::DelayedWakeService;
use crate::worker::thread;

/// Resource-exhaustion recovery delay for a failed worker spawn:
/// one-shot retry for worker creation after 500 µs.
const SPAWN_RETRY_DELAY: Duration = Duration::from_micros(500);

struct WorkerGroup {
    handles: Mutex<Vec<JoinHandle<()>>>,
    poller: Arc<Poller>,
    stack_size: AtomicUsize,
}

impl WorkerGroup {
    fn new(poller: Arc<Poller>) -> Self {
        Self { handles: Mutex::new(Vec::new()), poller, stack_size: AtomicUsize::new(0) }
    }
}

pub struct WorkerManager {
    groups: PerQos<WorkerGroup>,
    scheduler: Arc<Scheduler>,
    monitor: Arc<QosMonitor>,
    config: Arc<RuntimeConfig>,
    tearing_down: AtomicBool,
    self_weak: Mutex<Weak<WorkerManager>>,
}

impl WorkerManager {
    /// Constructs the manager and binds it as the scheduler's
    /// [`NotifyActionSink`] in one step — the scheduler exists first,
    /// with no sink, until this call.
    pub fn new(scheduler: Arc<Scheduler>, monitor: Arc<QosMonitor>, config: Arc<RuntimeConfig>) -> Arc<WorkerManager> {
        let groups = PerQos::from_fn(|_| {
            let poller = Poller::new().expect("create per-QoS poller");
            WorkerGroup::new(Arc::new(poller))
        });
        let manager = Arc::new_cyclic(|weak| WorkerManager {
            groups,
            scheduler: Arc::clone(&scheduler),
            monitor,
            config,
            tearing_down: AtomicBool::new(false),
            self_weak: Mutex::new(weak.clone()),
        });
        scheduler.bind_action_sink(manager.clone() as Arc<dyn NotifyActionSink>);
        manager
    }

    pub fn poller(&self, qos: QoS) -> &Arc<Poller> {
        &self.groups.get(qos).poller
    }

    fn upgrade(&self) -> Arc<WorkerManager> {
        self.self_weak.lock().expect("self_weak poisoned").upgrade().expect("worker manager dropped while still in use")
    }

    /// `IncWorker(qos)`: refuses if tearing down; otherwise spawns one
    /// more worker OS thread, retrying once after `SPAWN_RETRY_DELAY`
    /// if the OS refuses the spawn.
    pub fn inc_worker(&self, qos: QoS) {
        if self.tearing_down.load(Ordering::Acquire) {
            return;
        }
        self.monitor.group(qos).mark_spawned();
        if self.try_spawn(qos) {
            return;
        }
        self.monitor.group(qos).mark_retired();
        let this = self.upgrade();
        DelayedWakeService::global().schedule_after(SPAWN_RETRY_DELAY, move || {
            if this.tearing_down.load(Ordering::Acquire) {
                return;
            }
            this.monitor.group(qos).mark_spawned();
            if !this.try_spawn(qos) {
                this.monitor.group(qos).mark_retired();
                log::error!("worker spawn retry failed for qos {qos}");
            }
        });
    }

    fn try_spawn(&self, qos: QoS) -> bool {
        let scheduler = Arc::clone(&self.scheduler);
        let monitor = Arc::clone(&self.monitor);
        let config = Arc::clone(&self.config);
        let group = self.groups.get(qos);
        let poller = Arc::clone(&group.poller);
        let stack_size = group.stack_size.load(Ordering::Acquire);
        let built = std::thread::Builder::new()
            .name(format!("flowrt-worker-{qos}"))
            .spawn(move || thread::run(qos, scheduler, monitor, config, poller, stack_size));
        match built {
            Ok(handle) => {
                group.handles.lock().expect("worker handles poisoned").push(handle);
                true
            }
            Err(e) => {
                log::error!("spawn worker thread for qos {qos} failed: {e}");
                false
            }
        }
    }

    /// `NotifyWorkers(qos, n)`: synchronously spawn up to `n` additional
    /// workers for `qos`.
    pub fn notify_workers(&self, qos: QoS, n: usize) {
        for _ in 0..n {
            self.inc_worker(qos);
        }
    }

    /// `SetWorkerStackSize(qos, bytes)`: only allowed while the group has
    /// never been populated, since an in-flight worker's stack size
    /// can't change underneath it.
    pub fn set_worker_stack_size(&self, qos: QoS, bytes: usize) -> FlowrtResult<()> {
        let group = self.groups.get(qos);
        let handles = group.handles.lock().expect("worker handles poisoned");
        if !handles.is_empty() {
            return Err(FlowrtError::state_violation(format!("qos {qos} worker group already populated")));
        }
        drop(handles);
        group.stack_size.store(bytes, Ordering::Release);
        Ok(())
    }

    /// Called once from [`crate::execute_unit::ExecuteUnit`] teardown:
    /// flips the flag and wakes every sleeping worker/poller so idle
    /// loops observe it promptly instead of waiting out a sleep timer.
    pub fn begin_teardown(&self) {
        self.tearing_down.store(true, Ordering::Release);
        for (qos, group) in self.groups.iter() {
            self.monitor.group(qos).wake_all_sleepers();
            group.poller.wake_up();
        }
    }

    /// Joins every worker thread in every group, up to `timeout`
    /// total; logs a warning for any panics observed.
    pub fn join_all(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        for (qos, group) in self.groups.iter() {
            let handles: Vec<_> = group.handles.lock().expect("worker handles poisoned").drain(..).collect();
            for handle in handles {
                while !handle.is_finished() && Instant::now() < deadline {
                    std::thread::yield_now();
                }
                if let Err(e) = handle.join() {
                    log::warn!("worker thread for qos {qos} panicked during teardown: {e:?}");
                }
            }
        }
    }
}

impl NotifyActionSink for WorkerManager {
    fn act(&self, qos: QoS, action: NotifyAction) {
        match action {
            NotifyAction::None => {}
            NotifyAction::WakeSleepingWorker => self.monitor.group(qos).wake_one_sleeper(),
            NotifyAction::SpawnWorker => self.inc_worker(qos),
            NotifyAction::WakePoller => self.groups.get(qos).poller.wake_up(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn build() -> Arc<WorkerManager> {
        let scheduler = Arc::new(Scheduler::new());
        let cfg = Arc::new(RuntimeConfig::default());
        let monitor = Arc::new(QosMonitor::new(&cfg));
        WorkerManager::new(scheduler, monitor, cfg)
    }

    #[test]
    fn inc_worker_spawns_and_joins_cleanly() {
        let manager = build();
        manager.inc_worker(QoS::Default);
        std::thread::sleep(Duration::from_millis(20));
        manager.begin_teardown();
        manager.join_all(Duration::from_secs(2));
    }

    #[test]
    fn set_worker_stack_size_rejected_once_populated() {
        let manager = build();
        manager.inc_worker(QoS::Default);
        std::thread::sleep(Duration::from_millis(20));
        assert!(manager.set_worker_stack_size(QoS::Default, 256 * 1024).is_err());
        manager.begin_teardown();
        manager.join_all(Duration::from_secs(2));
    }

    #[test]
    fn act_spawn_worker_action_creates_a_worker() {
        let manager = build();
        manager.act(QoS::Default, NotifyAction::SpawnWorker);
        std::thread::sleep(Duration::from_millis(20));
        assert!(manager.monitor.group(QoS::Default).total() >= 1);
        manager.begin_teardown();
        manager.join_all(Duration::from_secs(2));
    }
}
