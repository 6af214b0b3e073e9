//! Concurrent queue: up to `max_concurrency` queue tasks may run in
//! parallel, with no ordering guarantee between them. Supports
//! `set_loop` so an external event loop can drive dispatch instead of
//! the scheduler.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use regex::Regex;

use super::when_map::WhenMap;
use super::{now_us, LoopSink, QueueAttr, QueueOps, QueueType, RunningRecord, TaskAttr};
use crate::error::{FlowrtError, FlowrtResult};
use crate::monitor::QosMonitor;
use crate::qos::QoS;
use crate::sched::Scheduler;
use crate::task::{NormalTask, Task, TaskId};
use crate::watchdog::{QueueMonitor, TaskWatchdog};

struct State {
    when_map: WhenMap,
    active: bool,
    running: Vec<RunningRecord>,
    loop_sink: Option<Arc<dyn LoopSink>>,
}

pub struct ConcurrentQueue {
    id: u32,
    attr: QueueAttr,
    is_exit: AtomicBool,
    in_flight: AtomicUsize,
    state: Mutex<State>,
    scheduler: Arc<Scheduler>,
    sched_monitor: Arc<QosMonitor>,
    queue_monitor: Arc<QueueMonitor>,
}

impl ConcurrentQueue {
    pub fn new(attr: QueueAttr, scheduler: Arc<Scheduler>, sched_monitor: Arc<QosMonitor>, queue_monitor: Arc<QueueMonitor>) -> Arc<Self> {
        Arc::new(Self {
            id: super::next_queue_id(),
            attr,
            is_exit: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            state: Mutex::new(State { when_map: WhenMap::new(), active: false, running: Vec::new(), loop_sink: None }),
            scheduler,
            sched_monitor,
            queue_monitor,
        })
    }

    /// Loop integration: when set, delivery is driven by the loop
    /// instead of the scheduler.
    pub fn set_loop(&self, sink: Option<Arc<dyn LoopSink>>) {
        self.state.lock().expect("concurrent queue state poisoned").loop_sink = sink;
    }

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
            let mut state = self.state.lock().expect("concurrent queue state poisoned");
            state.when_map.insert(task, attr.submit_head);
            let activate = !state.active;
            state.active = true;
            activate
        };
        if need_activate {
            self.deliver();
        }
        Ok(gid)
    }

    fn deliver(self: &Arc<Self>) {
        let sink = self.state.lock().expect("concurrent queue state poisoned").loop_sink.clone();
        match sink {
            Some(sink) => sink.deliver(self.id),
            None => {
                let this = Arc::clone(self);
                let dispatcher = NormalTask::spawn(self.attr.qos, None, None, Box::new(move || this.pull_and_dispatch()));
                self.scheduler.wakeup(self.attr.qos, Task::Normal(dispatcher), &self.sched_monitor);
            }
        }
    }

    /// Called either by the scheduler-driven placeholder or by the
    /// loop (`Loop::epoll_thread` invoking `LoopSink::deliver`).
    pub fn pull_and_dispatch(self: &Arc<Self>) {
        let now = now_us();
        let room = self.attr.max_concurrency.saturating_sub(self.in_flight.load(Ordering::Acquire));
        if room == 0 {
            return;
        }
        let batch: Vec<_> = {
            let mut state = self.state.lock().expect("concurrent queue state poisoned");
            if self.is_exit.load(Ordering::Acquire) {
                state.active = false;
                return;
            }
            let mut batch = Vec::new();
            for _ in 0..room {
                match state.when_map.pop_one_due(now) {
                    Some(task) => batch.push(task),
                    None => break,
                }
            }
            batch
        };

        if batch.is_empty() {
            self.rearm();
            return;
        }

        for task in batch {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            let this = Arc::clone(self);
            let dispatcher = NormalTask::spawn(self.attr.qos, None, None, Box::new(move || {
                this.dispatch_one(task);
                this.in_flight.fetch_sub(1, Ordering::AcqRel);
                this.rearm();
            }));
            self.scheduler.wakeup(self.attr.qos, Task::Normal(dispatcher), &self.sched_monitor);
        }
    }

    fn rearm(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("concurrent queue state poisoned");
        if self.is_exit.load(Ordering::Acquire) {
            state.active = false;
            return;
        }
        match state.when_map.head_uptime() {
            None => state.active = false,
            Some(_) => {
                drop(state);
                self.deliver();
            }
        }
    }

    fn dispatch_one(self: &Arc<Self>, task: Arc<crate::task::QueueTask>) {
        let gid = task.base().gid();
        let start = now_us();
        let record = RunningRecord { queue_id: self.id, task_id: gid, start_time_us: start };
        self.queue_monitor.record_start(record);
        self.state.lock().expect("concurrent queue state poisoned").running.push(record);

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
        self.state.lock().expect("concurrent queue state poisoned").running.retain(|r| r.task_id != gid);
        task.base().dec_delete_ref();
    }
}

impl QueueOps for ConcurrentQueue {
    fn queue_id(&self) -> u32 {
        self.id
    }

    fn queue_type(&self) -> QueueType {
        QueueType::Concurrent
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock().expect("concurrent queue state poisoned");
        state.running.is_empty() && state.when_map.is_empty()
    }

    fn has_task(&self, pattern: &Regex) -> bool {
        self.state.lock().expect("concurrent queue state poisoned").when_map.has_task(pattern)
    }

    fn cancel_all(&self) {
        let mut state = self.state.lock().expect("concurrent queue state poisoned");
        for task in state.when_map.remove_all() {
            task.base().mark_exited();
            task.base().dec_delete_ref();
        }
        self.is_exit.store(true, Ordering::Release);
    }

    fn cancel_by_name(&self, pattern: &Regex) -> bool {
        let mut state = self.state.lock().expect("concurrent queue state poisoned");
        let removed = state.when_map.remove_matching(pattern);
        let any = !removed.is_empty();
        for task in removed {
            task.base().mark_exited();
            task.base().dec_delete_ref();
        }
        any
    }

    fn cancel_task(&self, id: TaskId) -> bool {
        let mut state = self.state.lock().expect("concurrent queue state poisoned");
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
            if self.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }
            std::thread::yield_now();
        }
        self.cancel_all();
    }
}
