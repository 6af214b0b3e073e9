//! Serial queue: strictly one task in flight at a time, same-timestamp
//! tasks run in submission order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use regex::Regex;

use super::when_map::WhenMap;
use super::{now_us, QueueAttr, QueueOps, QueueType, RunningRecord, TaskAttr};
use crate::error::{FlowrtError, FlowrtResult};
use crate::monitor::QosMonitor;
use crate::qos::QoS;
use crate::sched::Scheduler;
use crate::task::{NormalTask, Task, TaskId};
use crate::watchdog::{QueueMonitor, TaskWatchdog};

struct State {
    when_map: WhenMap,
    active: bool,
    running: Option<RunningRecord>,
}

pub struct SerialQueue {
    id: u32,
    attr: QueueAttr,
    is_exit: AtomicBool,
    state: Mutex<State>,
    scheduler: Arc<Scheduler>,
    sched_monitor: Arc<QosMonitor>,
    queue_monitor: Arc<QueueMonitor>,
}

impl SerialQueue {
    pub fn new(attr: QueueAttr, scheduler: Arc<Scheduler>, sched_monitor: Arc<QosMonitor>, queue_monitor: Arc<QueueMonitor>) -> Arc<Self> {
        Arc::new(Self {
            id: super::next_queue_id(),
            attr,
            is_exit: AtomicBool::new(false),
            state: Mutex::new(State { when_map: WhenMap::new(), active: false, running: None }),
            scheduler,
            sched_monitor,
            queue_monitor,
        })
    }

    /// Enqueue a task for this queue, activating dispatch if idle.
    pub fn submit(self: &Arc<Self>, body: crate::task::TaskBody, attr: TaskAttr) -> FlowrtResult<TaskId> {
        if self.is_exit.load(Ordering::Acquire) {
            return Err(FlowrtError::state_violation(format!("submit on exiting queue {}", self.id)));
        }
        let qos = QoS::normalize(attr.qos_raw, self.attr.qos)?;
        let uptime = now_us() + attr.delay_us;
        let timeout_us = if attr.timeout_us > 0 { attr.timeout_us } else { self.attr.timeout_us };
        let task = crate::task::QueueTask::new(qos, self.id, attr.label.clone(), body, uptime, None, timeout_us);
        let gid = task.base().gid();

        let need_activate = {
            let mut state = self.state.lock().expect("serial queue state poisoned");
            state.when_map.insert(task, attr.submit_head);
            let activate = !state.active;
            state.active = true;
            activate
        };
        if need_activate {
            self.activate();
        }
        Ok(gid)
    }

    /// Construct the empty placeholder task and hand it to the
    /// scheduler; its dispatch is what actually calls `pull_and_dispatch`.
    fn activate(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let body: crate::task::TaskBody = Box::new(move || this.pull_and_dispatch());
        let dispatcher = NormalTask::spawn(self.attr.qos, None, None, body);
        self.scheduler.wakeup(self.attr.qos, Task::Normal(dispatcher), &self.sched_monitor);
    }

    /// Pull + dispatch one due task, re-arming as needed. Runs on a
    /// worker via the placeholder task's body.
    fn pull_and_dispatch(self: &Arc<Self>) {
        let now = now_us();
        let popped = {
            let mut state = self.state.lock().expect("serial queue state poisoned");
            if self.is_exit.load(Ordering::Acquire) {
                state.active = false;
                return;
            }
            state.when_map.pop_one_due(now)
        };

        match popped {
            Some(task) => {
                self.dispatch_one(task);
                self.continue_or_rearm();
            }
            None => self.continue_or_rearm(),
        }
    }

    fn continue_or_rearm(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("serial queue state poisoned");
        if self.is_exit.load(Ordering::Acquire) {
            state.active = false;
            return;
        }
        match state.when_map.head_uptime() {
            None => state.active = false,
            Some(next_due) => {
                drop(state);
                let this = Arc::clone(self);
                let now = now_us();
                if next_due <= now {
                    // More work is already due: re-chain immediately
                    // through the scheduler instead of recursing, so a
                    // long backlog doesn't grow the call stack.
                    self.activate_continuation(this);
                } else {
                    let delay = std::time::Duration::from_micros(next_due - now);
                    crate::watchdog::DelayedWakeService::global().schedule_after(delay, move || this.pull_and_dispatch());
                }
            }
        }
    }

    fn activate_continuation(self: &Arc<Self>, this: Arc<Self>) {
        let body: crate::task::TaskBody = Box::new(move || this.pull_and_dispatch());
        let dispatcher = NormalTask::spawn(self.attr.qos, None, None, body);
        self.scheduler.wakeup(self.attr.qos, Task::Normal(dispatcher), &self.sched_monitor);
    }

    fn dispatch_one(self: &Arc<Self>, task: Arc<crate::task::QueueTask>) {
        let gid = task.base().gid();
        let start = now_us();
        self.queue_monitor.record_start(RunningRecord { queue_id: self.id, task_id: gid, start_time_us: start });
        {
            let mut state = self.state.lock().expect("serial queue state poisoned");
            state.running = Some(RunningRecord { queue_id: self.id, task_id: gid, start_time_us: start });
        }

        let watchdog = if task.timeout_us() > 0 {
            self.attr.timeout_cb.clone().map(|cb| TaskWatchdog::arm(self.id, gid, task.timeout_us(), cb))
        } else {
            None
        };

        if let Some(body) = task.base().take_body() {
            body();
        }
        task.base().mark_exited();

        if let Some(wd) = watchdog {
            wd.disarm();
        }
        self.queue_monitor.clear(self.id);
        {
            let mut state = self.state.lock().expect("serial queue state poisoned");
            state.running = None;
        }
        task.base().dec_delete_ref();
    }
}

impl QueueOps for SerialQueue {
    fn queue_id(&self) -> u32 {
        self.id
    }

    fn queue_type(&self) -> QueueType {
        QueueType::Serial
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock().expect("serial queue state poisoned");
        state.running.is_none() && state.when_map.is_empty()
    }

    fn has_task(&self, pattern: &Regex) -> bool {
        self.state.lock().expect("serial queue state poisoned").when_map.has_task(pattern)
    }

    fn cancel_all(&self) {
        let mut state = self.state.lock().expect("serial queue state poisoned");
        for task in state.when_map.remove_all() {
            task.base().mark_exited();
            task.base().dec_delete_ref();
        }
        self.is_exit.store(true, Ordering::Release);
    }

    fn cancel_by_name(&self, pattern: &Regex) -> bool {
        let mut state = self.state.lock().expect("serial queue state poisoned");
        let removed = state.when_map.remove_matching(pattern);
        let any = !removed.is_empty();
        for task in removed {
            task.base().mark_exited();
            task.base().dec_delete_ref();
        }
        any
    }

    fn cancel_task(&self, id: TaskId) -> bool {
        let mut state = self.state.lock().expect("serial queue state poisoned");
        match state.when_map.remove_task(id) {
            Some(task) => {
                task.base().mark_exited();
                task.base().dec_delete_ref();
                true
            }
            None => false,
        }
    }

    fn cancel_and_wait(&self) {
        loop {
            if !self.queue_monitor.is_running(self.id) {
                break;
            }
            std::thread::yield_now();
        }
        self.cancel_all();
    }
}
