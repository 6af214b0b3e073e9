//! Per-thread CPU worker loop: pick up a task, run it to completion
//! or park, repeat; retire on sustained idleness.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crossbeam::deque::Worker as LocalDeque;

use crate::config::RuntimeConfig;
use crate::coroutine::{self, SwitchOutcome};
use crate::monitor::{IdleAction, NotifyKind, QosMonitor};
use crate::poller::Poller;
use crate::qos::QoS;
use crate::sched::{Scheduler, WorkerTicker};
use crate::task::{Task, TaskId, TaskState};

/// How many consecutive empty pickups a worker tolerates before
/// entering the idle-sleep protocol.
const GLOBAL_RECHECK_INTERVAL: u64 = 61;

/// The handles a running task body needs to call back into the
/// runtime (`task::wait_fd`) — bound once per worker OS thread at the
/// top of [`run`], not per task.
#[derive(Clone)]
pub struct WorkerRuntimeHandles {
    pub scheduler: Arc<Scheduler>,
    pub monitor: Arc<QosMonitor>,
    pub poller: Arc<Poller>,
    pub qos: QoS,
}

thread_local! {
    static RUNTIME_HANDLES: RefCell<Option<WorkerRuntimeHandles>> = const { RefCell::new(None) };
}

/// The calling thread's bound [`WorkerRuntimeHandles`], or `None` off a
/// CPU worker thread.
pub fn current_handles() -> Option<WorkerRuntimeHandles> {
    RUNTIME_HANDLES.with(|h| h.borrow().clone())
}

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide registry of each live worker's currently-dispatched
/// task, kept up to date by [`execute`] as tasks are picked up and
/// finish. This is what lets [`snapshot_worker_tasks`] answer "what is
/// each worker running right now" for [`crate::watchdog::WorkerMonitor`]
/// to sample.
fn task_registry() -> &'static Mutex<HashMap<u64, Option<TaskId>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Option<TaskId>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A `(worker_id, current_task)` snapshot across every live worker
/// thread, taken for one pass of the worker monitor's sampling loop.
pub fn snapshot_worker_tasks() -> Vec<(u64, Option<TaskId>)> {
    task_registry().lock().expect("worker task registry poisoned").iter().map(|(&id, &task)| (id, task)).collect()
}

/// Body of one CPU worker OS thread for a given QoS group. Returns when
/// the worker retires (idle past the destruct threshold, or teardown).
/// `stack_size` is the per-group coroutine stack size in effect at
/// spawn time (`WorkerManager::set_worker_stack_size`'s override, or
/// the process default).
pub fn run(qos: QoS, scheduler: Arc<Scheduler>, monitor: Arc<QosMonitor>, config: Arc<RuntimeConfig>, poller: Arc<Poller>, stack_size: usize) {
    RUNTIME_HANDLES.with(|h| {
        *h.borrow_mut() = Some(WorkerRuntimeHandles {
            scheduler: Arc::clone(&scheduler),
            monitor: Arc::clone(&monitor),
            poller: Arc::clone(&poller),
            qos,
        });
    });

    let worker_id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
    task_registry().lock().expect("worker task registry poisoned").insert(worker_id, None);

    let local: LocalDeque<Task> = scheduler.register_worker(qos);
    let mut ticker = WorkerTicker::new(GLOBAL_RECHECK_INTERVAL);

    loop {
        if scheduler.is_tearing_down() {
            break;
        }
        match scheduler.try_pickup(qos, &local, &mut ticker) {
            Some(task) => {
                monitor.notify(qos, NotifyKind::TaskPicked);
                task_registry().lock().expect("worker task registry poisoned").insert(worker_id, Some(task.gid()));
                execute(&task, &scheduler, &config, stack_size);
                task_registry().lock().expect("worker task registry poisoned").insert(worker_id, None);
            }
            None => {
                let group = monitor.group(qos);
                // At most one worker per QoS group polls at a time; a
                // successful poll may have delivered events that woke
                // parked tasks, so loop back to try_pickup instead of
                // falling straight to sleep.
                let light_sleep_timeout = config.light_sleep_timeout();
                if group.enter_poll_wait() {
                    if let Err(e) = poller.poll_once(light_sleep_timeout.as_millis() as i32) {
                        log::warn!("poll_once failed for qos {qos}: {e}");
                    }
                    group.exit_poll_wait();
                    continue;
                }
                let action = group.idle_sleep(light_sleep_timeout, config.idle_worker_destruct, || {
                    // No worker-owned coroutine stack to free: stacks are
                    // bound to tasks (see `task::base::TaskBase`), not to
                    // the worker thread itself.
                });
                match action {
                    IdleAction::Retry => continue,
                    IdleAction::Retire => break,
                }
            }
        }
    }

    scheduler.unregister_worker(qos);
    monitor.group(qos).mark_retired();
    RUNTIME_HANDLES.with(|h| *h.borrow_mut() = None);
    task_registry().lock().expect("worker task registry poisoned").remove(&worker_id);
}

/// Dispatch one popped task to completion or park.
fn execute(task: &Task, scheduler: &Arc<Scheduler>, config: &RuntimeConfig, stack_size: usize) {
    match task {
        Task::IoExecutor(t) => {
            if let Err(e) = t.run() {
                log::warn!("io_executor_task {} failed: {e}", t.base().gid());
            }
        }
        Task::Normal(t) => run_coroutine(t.base(), task, scheduler, config, stack_size),
        Task::Queue(t) => run_coroutine(t.base(), task, scheduler, config, stack_size),
    }
}

fn run_coroutine(base: &crate::task::TaskBase, task: &Task, scheduler: &Arc<Scheduler>, config: &RuntimeConfig, stack_size: usize) {
    if base.state() == TaskState::Pending {
        if let Err(e) = base.mark_ready() {
            log::error!("task {} failed PENDING -> READY: {e}", base.gid());
            return;
        }
    }

    let effective_stack_size = if stack_size > 0 { stack_size } else { config.default_stack_size };
    match coroutine::co_start(base, effective_stack_size, config.strong_stack_protect) {
        Ok(SwitchOutcome::Completed) => {
            // Pairs with the delete-ref bump a submitter makes while the
            // task is reachable from the scheduler (see
            // `task::base::TaskBase::new`'s doc comment).
            base.dec_delete_ref();
        }
        Ok(SwitchOutcome::Parked) => {
            // Keep the task alive in the scheduler's parked table until
            // whoever satisfies the wake condition calls `co_wake` and
            // resubmits it.
            scheduler.park(task.clone());
        }
        Err(e) => {
            log::error!("coroutine dispatch failed for task {}: {e}", base.gid());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::NormalTask;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn completed_task_drops_delete_ref() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let task = NormalTask::spawn(QoS::Default, None, None, Box::new(move || r.store(true, Ordering::SeqCst)));
        let scheduler = Arc::new(Scheduler::new());
        let cfg = RuntimeConfig::default();
        let wrapped = Task::Normal(Arc::clone(&task));
        run_coroutine(task.base(), &wrapped, &scheduler, &cfg, 0);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(task.base().state(), TaskState::Exited);
    }
}
