//! QoS monitor.
//!
//! Per-QoS worker-count bookkeeping (`WorkerCtrl`) plus three pluggable
//! notification strategies and the two-stage idle-sleep policy. The
//! actual OS-thread spawn/wake calls live in `worker::manager`, which
//! consumes the [`NotifyAction`]/[`IdleAction`] this module decides.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::config::{EscapeStages, NotifyStrategy, RuntimeConfig};
use crate::error::{FlowrtError, FlowrtResult};
use crate::qos::{PerQos, QoS};

/// Event kinds the scheduler/workers feed into `Notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    TaskAdded,
    TaskPicked,
    TaskLocal,
    TaskEscaped,
}

/// What the caller (CPU worker manager) should do in response to a
/// `notify` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    None,
    WakeSleepingWorker,
    SpawnWorker,
    WakePoller,
}

/// What a worker should do after finding no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    Retry,
    Retire,
}

/// Consumes the [`NotifyAction`] a `Notify` call decided on. The CPU
/// worker manager is the only implementor: waking a sleeping worker,
/// spawning a new one, or waking the QoS's poller are all actions only
/// it has the resources to perform. The scheduler holds this as an
/// optional, lazily-bound sink rather than a hard constructor
/// dependency, since `Scheduler` is constructed before the worker
/// manager that will consume its notifications exists.
pub trait NotifyActionSink: Send + Sync {
    fn act(&self, qos: QoS, action: NotifyAction);
}

const SUPPRESS_WORKERS_THRESHOLD: usize = 4;
const SUPPRESS_EXEC_THRESHOLD: usize = 2;

/// Optional hook for block-aware scaling: lets a caller report how many
/// executing workers of a QoS are blocked on a syscall rather than
/// genuinely running, so `Notify`'s `running` count can discount them.
/// The default implementation always reports zero — block-aware
/// scaling is opt-in and platform-specific.
pub trait BlockAwareProbe: Send + Sync {
    fn blocked_count(&self, qos: QoS) -> usize;
}

pub struct NoBlockAwareProbe;

impl BlockAwareProbe for NoBlockAwareProbe {
    fn blocked_count(&self, _qos: QoS) -> usize {
        0
    }
}

/// Per-QoS bookkeeping, mutex-guarded in spirit via atomics (each
/// field's own source of truth) plus a dedicated `Mutex<()>`/`Condvar`
/// pair for the idle-sleep wait.
pub struct WorkerCtrl {
    hard_limit: AtomicUsize,
    max_concurrency: AtomicUsize,
    executing: AtomicUsize,
    sleeping: AtomicUsize,
    deep_sleeping: AtomicUsize,
    poll_wait_flag: AtomicBool,
    sleep_mutex: Mutex<()>,
    sleep_cvar: Condvar,
}

impl WorkerCtrl {
    fn new(hard_limit: usize, max_concurrency: usize) -> Self {
        Self {
            hard_limit: AtomicUsize::new(hard_limit),
            max_concurrency: AtomicUsize::new(max_concurrency),
            executing: AtomicUsize::new(0),
            sleeping: AtomicUsize::new(0),
            deep_sleeping: AtomicUsize::new(0),
            poll_wait_flag: AtomicBool::new(false),
            sleep_mutex: Mutex::new(()),
            sleep_cvar: Condvar::new(),
        }
    }

    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::Acquire)
    }

    pub fn sleeping(&self) -> usize {
        self.sleeping.load(Ordering::Acquire)
    }

    pub fn deep_sleeping(&self) -> usize {
        self.deep_sleeping.load(Ordering::Acquire)
    }

    pub fn hard_limit(&self) -> usize {
        self.hard_limit.load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        self.executing() + self.sleeping()
    }

    /// Invariant checked by tests and debug assertions:
    /// `executing + sleeping <= hard_limit`.
    pub fn within_hard_limit(&self) -> bool {
        self.total() <= self.hard_limit()
    }

    pub fn mark_spawned(&self) {
        self.executing.fetch_add(1, Ordering::AcqRel);
    }

    pub fn mark_retired(&self) {
        self.executing.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn mark_sleeping(&self) {
        self.executing.fetch_sub(1, Ordering::AcqRel);
        self.sleeping.fetch_add(1, Ordering::AcqRel);
    }

    pub fn mark_woken(&self) {
        self.sleeping.fetch_sub(1, Ordering::AcqRel);
        self.executing.fetch_add(1, Ordering::AcqRel);
    }

    pub fn mark_deep_sleeping(&self) {
        self.deep_sleeping.fetch_add(1, Ordering::AcqRel);
    }

    pub fn mark_deep_woken(&self) {
        self.deep_sleeping.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn enter_poll_wait(&self) -> bool {
        !self.poll_wait_flag.swap(true, Ordering::AcqRel)
    }

    pub fn exit_poll_wait(&self) {
        self.poll_wait_flag.store(false, Ordering::Release);
    }

    pub fn is_polling(&self) -> bool {
        self.poll_wait_flag.load(Ordering::Acquire)
    }

    pub fn wake_one_sleeper(&self) {
        let _guard = self.sleep_mutex.lock().expect("sleep_mutex poisoned");
        self.sleep_cvar.notify_one();
    }

    pub fn wake_all_sleepers(&self) {
        let _guard = self.sleep_mutex.lock().expect("sleep_mutex poisoned");
        self.sleep_cvar.notify_all();
    }

    /// Two-stage idle sleep: light sleep first with a timeout, then
    /// (unless idle-destroy is enabled) deep sleep without one.
    /// `release_stack` is invoked exactly once, right before the
    /// deep-sleep wait, so the caller can free the worker's current
    /// coroutine stack memory.
    pub fn idle_sleep(&self, light_timeout: Duration, idle_destroy: bool, release_stack: impl FnOnce()) -> IdleAction {
        self.mark_sleeping();
        {
            let guard = self.sleep_mutex.lock().expect("sleep_mutex poisoned");
            let (_guard, timed_out) = self
                .sleep_cvar
                .wait_timeout(guard, light_timeout)
                .expect("sleep_cvar poisoned");
            if !timed_out.timed_out() {
                self.mark_woken();
                return IdleAction::Retry;
            }
        }
        if idle_destroy {
            self.mark_woken();
            return IdleAction::Retire;
        }
        release_stack();
        self.mark_deep_sleeping();
        {
            let guard = self.sleep_mutex.lock().expect("sleep_mutex poisoned");
            let _guard = self.sleep_cvar.wait(guard).expect("sleep_cvar poisoned");
        }
        self.mark_deep_woken();
        self.mark_woken();
        IdleAction::Retry
    }
}

pub struct QosMonitor {
    strategy: NotifyStrategy,
    groups: PerQos<WorkerCtrl>,
    escape_enable: AtomicBool,
    escape_stages: Mutex<EscapeStages>,
    escape_configured: AtomicBool,
    probe: Box<dyn BlockAwareProbe>,
}

impl QosMonitor {
    pub fn new(cfg: &RuntimeConfig) -> Self {
        let hard = cfg.hard_limit_table();
        let workers = cfg.cpu_worker_num_table();
        Self {
            strategy: cfg.notify_strategy,
            groups: PerQos::from_fn(|qos| WorkerCtrl::new(*hard.get(qos), *workers.get(qos))),
            escape_enable: AtomicBool::new(cfg.escape_enable),
            escape_stages: Mutex::new(cfg.escape_stages),
            escape_configured: AtomicBool::new(false),
            probe: Box::new(NoBlockAwareProbe),
        }
    }

    pub fn group(&self, qos: QoS) -> &WorkerCtrl {
        self.groups.get(qos)
    }

    pub fn set_block_aware_probe(&mut self, probe: Box<dyn BlockAwareProbe>) {
        self.probe = probe;
    }

    /// Decide the action a caller holding a pending task count should
    /// take.
    pub fn notify(&self, qos: QoS, kind: NotifyKind) -> NotifyAction {
        self.notify_with_task_count(qos, kind, 1)
    }

    pub fn notify_with_task_count(&self, qos: QoS, kind: NotifyKind, task_count: usize) -> NotifyAction {
        let group = self.group(qos);
        let blocked = self.probe.blocked_count(qos);
        let running = group.executing().saturating_sub(blocked);
        let total = group.total();
        let max_concurrency = group.max_concurrency.load(Ordering::Acquire);

        match self.strategy {
            NotifyStrategy::Default => self.notify_default(group, kind, task_count, running, total, max_concurrency),
            NotifyStrategy::Conservative => {
                if kind == NotifyKind::TaskPicked {
                    let awake = running.max(1);
                    if (task_count as f64) / (awake as f64) > 1.0 {
                        return self.wake_or_spawn(group, running, total, max_concurrency);
                    }
                    return NotifyAction::None;
                }
                self.notify_default(group, kind, task_count, running, total, max_concurrency)
            }
            NotifyStrategy::UltraConservative => {
                if task_count >= running && running < max_concurrency {
                    self.wake_or_spawn(group, running, total, max_concurrency)
                } else {
                    NotifyAction::None
                }
            }
        }
    }

    fn notify_default(
        &self,
        group: &WorkerCtrl,
        kind: NotifyKind,
        task_count: usize,
        running: usize,
        total: usize,
        max_concurrency: usize,
    ) -> NotifyAction {
        let suppressible = !matches!(kind, NotifyKind::TaskAdded | NotifyKind::TaskEscaped);
        if total > SUPPRESS_WORKERS_THRESHOLD
            && running > SUPPRESS_EXEC_THRESHOLD
            && task_count < running
            && suppressible
        {
            return NotifyAction::None;
        }
        self.wake_or_spawn(group, running, total, max_concurrency)
    }

    fn wake_or_spawn(&self, group: &WorkerCtrl, running: usize, total: usize, max_concurrency: usize) -> NotifyAction {
        if group.sleeping() > 0 && running < max_concurrency {
            return NotifyAction::WakeSleepingWorker;
        }
        if (running < max_concurrency && total < group.hard_limit()) || running == 0 {
            return NotifyAction::SpawnWorker;
        }
        if group.is_polling() {
            return NotifyAction::WakePoller;
        }
        NotifyAction::None
    }

    /// Worker-escape staged interval lookup: the delay a
    /// newly-over-threshold group must wait before spawning another
    /// worker.
    pub fn escape_interval(&self, qos: QoS) -> Option<Duration> {
        if !self.escape_enable.load(Ordering::Acquire) {
            return None;
        }
        let stages = *self.escape_stages.lock().expect("escape stages poisoned");
        let workers = self.group(qos).total();
        Some(if workers < stages.stage1_workers {
            stages.stage1_interval
        } else if workers < stages.stage2_workers {
            stages.stage2_interval
        } else {
            stages.stage3_interval
        })
    }

    /// One-shot configuration call. Rejects a second call, and rejects
    /// any stage interval weaker (larger) than the compiled-in default,
    /// since escape exists to bound recovery latency, not to be dialed
    /// back up.
    pub fn set_escape_enable(&self, stages: EscapeStages) -> FlowrtResult<()> {
        if self.escape_configured.swap(true, Ordering::AcqRel) {
            return Err(FlowrtError::state_violation("escape already configured"));
        }
        let default = EscapeStages::default();
        if stages.stage1_interval > default.stage1_interval
            || stages.stage2_interval > default.stage2_interval
            || stages.stage3_interval > default.stage3_interval
        {
            self.escape_configured.store(false, Ordering::Release);
            return Err(FlowrtError::invalid_argument("escape stage intervals weaker than default"));
        }
        *self.escape_stages.lock().expect("escape stages poisoned") = stages;
        self.escape_enable.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_limit_invariant_holds_after_spawn_and_sleep() {
        let cfg = RuntimeConfig::default();
        let monitor = QosMonitor::new(&cfg);
        let group = monitor.group(QoS::Default);
        group.mark_spawned();
        assert!(group.within_hard_limit());
        group.mark_sleeping();
        assert!(group.within_hard_limit());
    }

    #[test]
    fn default_strategy_spawns_when_no_workers_running() {
        let cfg = RuntimeConfig::default();
        let monitor = QosMonitor::new(&cfg);
        let action = monitor.notify(QoS::Default, NotifyKind::TaskAdded);
        assert_eq!(action, NotifyAction::SpawnWorker);
    }

    #[test]
    fn ultra_conservative_requires_task_count_at_least_running() {
        let mut cfg = RuntimeConfig::default();
        cfg.notify_strategy = NotifyStrategy::UltraConservative;
        let monitor = QosMonitor::new(&cfg);
        let group = monitor.group(QoS::Default);
        group.mark_spawned();
        let action = monitor.notify_with_task_count(QoS::Default, NotifyKind::TaskPicked, 0);
        assert_eq!(action, NotifyAction::None);
    }

    #[test]
    fn escape_interval_is_none_when_disabled() {
        let cfg = RuntimeConfig::default();
        let monitor = QosMonitor::new(&cfg);
        assert!(monitor.escape_interval(QoS::Default).is_none());
    }

    #[test]
    fn set_escape_enable_is_one_shot() {
        let cfg = RuntimeConfig::default();
        let monitor = QosMonitor::new(&cfg);
        assert!(monitor.set_escape_enable(EscapeStages::default()).is_ok());
        assert!(monitor.escape_interval(QoS::Default).is_some());
        assert!(monitor.set_escape_enable(EscapeStages::default()).is_err());
    }

    #[test]
    fn set_escape_enable_rejects_weaker_than_default() {
        let cfg = RuntimeConfig::default();
        let monitor = QosMonitor::new(&cfg);
        let mut weak = EscapeStages::default();
        weak.stage1_interval = weak.stage1_interval * 10;
        assert!(monitor.set_escape_enable(weak).is_err());
    }
}
