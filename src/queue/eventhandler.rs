//! Eventhandler queue variants: `eventhandler_interactive`
//! (loop-driven, single task in flight, reuses [`ConcurrentQueue`]
//! forced to `max_concurrency = 1`) and `eventhandler_adapter` (five
//! priority lanes, history ring, `dump`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use regex::Regex;

use super::concurrent::ConcurrentQueue;
use super::when_map::WhenMap;
use super::{now_us, HistoryEntry, LoopSink, QueueAttr, QueueOps, QueueType, RunningRecord, TaskAttr};
use crate::error::{FlowrtError, FlowrtResult};
use crate::monitor::QosMonitor;
use crate::qos::QoS;
use crate::sched::Scheduler;
use crate::task::{AdapterPriority, NormalTask, Task, TaskId};
use crate::watchdog::{QueueMonitor, TaskWatchdog};

const HISTORY_CAPACITY: usize = 128;

/// `eventhandler_interactive`: identical dispatch shape to the
/// concurrent variant, permanently capped at one in-flight task and
/// always loop-driven once a loop is attached.
pub struct EventHandlerInteractive {
    inner: Arc<ConcurrentQueue>,
}

impl EventHandlerInteractive {
    pub fn new(mut attr: QueueAttr, scheduler: Arc<Scheduler>, sched_monitor: Arc<QosMonitor>, queue_monitor: Arc<QueueMonitor>) -> Arc<Self> {
        attr.max_concurrency = 1;
        Arc::new(Self { inner: ConcurrentQueue::new(attr, scheduler, sched_monitor, queue_monitor) })
    }

    pub fn set_loop(&self, sink: Option<Arc<dyn LoopSink>>) {
        self.inner.set_loop(sink);
    }

    pub fn submit(self: &Arc<Self>, body: crate::task::TaskBody, attr: TaskAttr) -> FlowrtResult<TaskId> {
        self.inner.submit(body, attr)
    }

    pub fn pull_and_dispatch(self: &Arc<Self>) {
        self.inner.pull_and_dispatch();
    }
}

impl QueueOps for EventHandlerInteractive {
    fn queue_id(&self) -> u32 {
        self.inner.queue_id()
    }

    fn queue_type(&self) -> QueueType {
        QueueType::EventHandlerInteractive
    }

    fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }

    fn has_task(&self, pattern: &Regex) -> bool {
        self.inner.has_task(pattern)
    }

    fn cancel_all(&self) {
        self.inner.cancel_all()
    }

    fn cancel_by_name(&self, pattern: &Regex) -> bool {
        self.inner.cancel_by_name(pattern)
    }

    fn cancel_task(&self, id: TaskId) -> bool {
        self.inner.cancel_task(id)
    }

    fn cancel_and_wait(&self) {
        self.inner.cancel_and_wait()
    }
}

struct AdapterState {
    lanes: [WhenMap; 5],
    active: bool,
    running: Option<RunningRecord>,
    history: VecDeque<HistoryEntry>,
}

/// `eventhandler_adapter`: five priority lanes (`vip > immediate > high
/// > low > idle`); within a lane, FIFO by `uptime`; `idle` only runs
/// once every other lane is genuinely empty, not merely not-yet-due.
pub struct EventHandlerAdapter {
    id: u32,
    attr: QueueAttr,
    is_exit: AtomicBool,
    state: Mutex<AdapterState>,
    scheduler: Arc<Scheduler>,
    sched_monitor: Arc<QosMonitor>,
    queue_monitor: Arc<QueueMonitor>,
}

impl EventHandlerAdapter {
    pub fn new(attr: QueueAttr, scheduler: Arc<Scheduler>, sched_monitor: Arc<QosMonitor>, queue_monitor: Arc<QueueMonitor>) -> Arc<Self> {
        Arc::new(Self {
            id: super::next_queue_id(),
            attr,
            is_exit: AtomicBool::new(false),
            state: Mutex::new(AdapterState {
                lanes: std::array::from_fn(|_| WhenMap::new()),
                active: false,
                running: None,
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
            }),
            scheduler,
            sched_monitor,
            queue_monitor,
        })
    }

    pub fn submit(self: &Arc<Self>, body: crate::task::TaskBody, attr: TaskAttr) -> FlowrtResult<TaskId> {
        if self.is_exit.load(Ordering::Acquire) {
            return Err(FlowrtError::state_violation(format!("submit on exiting queue {}", self.id)));
        }
        let qos = QoS::normalize(attr.qos_raw, self.attr.qos)?;
        let uptime = now_us() + attr.delay_us;
        let timeout_us = if attr.timeout_us > 0 { attr.timeout_us } else { self.attr.timeout_us };
        let priority = attr.priority.unwrap_or(AdapterPriority::Low);
        let task = crate::task::QueueTask::new(qos, self.id, attr.label.clone(), body, uptime, Some(priority), timeout_us);
        let gid = task.base().gid();

        let need_activate = {
            let mut state = self.state.lock().expect("adapter queue state poisoned");
            state.lanes[priority as usize].insert(task, attr.submit_head);
            let activate = !state.active;
            state.active = true;
            activate
        };
        if need_activate {
            self.activate();
        }
        Ok(gid)
    }

    fn activate(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let dispatcher = NormalTask::spawn(self.attr.qos, None, None, Box::new(move || this.pull_and_dispatch()));
        self.scheduler.wakeup(self.attr.qos, Task::Normal(dispatcher), &self.sched_monitor);
    }

    fn pull_and_dispatch(self: &Arc<Self>) {
        let now = now_us();
        let batch = {
            let mut state = self.state.lock().expect("adapter queue state poisoned");
            if self.is_exit.load(Ordering::Acquire) {
                state.active = false;
                return;
            }
            self.pop_priority_sorted_batch(&mut state, now)
        };

        if batch.is_empty() {
            self.rearm();
            return;
        }
        for task in batch {
            self.dispatch_one(task);
        }
        self.rearm();
    }

    fn pop_priority_sorted_batch(&self, state: &mut AdapterState, now: u64) -> Vec<Arc<crate::task::QueueTask>> {
        let mut batch = Vec::new();
        for priority in [AdapterPriority::Vip, AdapterPriority::Immediate, AdapterPriority::High, AdapterPriority::Low] {
            batch.extend(state.lanes[priority as usize].pop_all_due(now));
        }
        let higher_lanes_empty = [AdapterPriority::Vip, AdapterPriority::Immediate, AdapterPriority::High, AdapterPriority::Low]
            .iter()
            .all(|p| state.lanes[*p as usize].is_empty());
        if higher_lanes_empty {
            batch.extend(state.lanes[AdapterPriority::Idle as usize].pop_all_due(now));
        }
        batch
    }

    fn rearm(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("adapter queue state poisoned");
        if self.is_exit.load(Ordering::Acquire) {
            state.active = false;
            return;
        }
        let next_due = AdapterPriority::iter_high_to_low()
            .filter_map(|p| state.lanes[p as usize].head_uptime())
            .min();
        match next_due {
            None => state.active = false,
            Some(next_due) => {
                drop(state);
                let now = now_us();
                if next_due <= now {
                    self.activate();
                } else {
                    let this = Arc::clone(self);
                    let delay = std::time::Duration::from_micros(next_due - now);
                    crate::watchdog::DelayedWakeService::global().schedule_after(delay, move || this.pull_and_dispatch());
                }
            }
        }
    }

    fn dispatch_one(self: &Arc<Self>, task: Arc<crate::task::QueueTask>) {
        let gid = task.base().gid();
        let trigger_time = now_us();
        self.queue_monitor.record_start(RunningRecord { queue_id: self.id, task_id: gid, start_time_us: trigger_time });
        {
            let mut state = self.state.lock().expect("adapter queue state poisoned");
            state.running = Some(RunningRecord { queue_id: self.id, task_id: gid, start_time_us: trigger_time });
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
        let complete_time = now_us();
        self.queue_monitor.clear(self.id);
        {
            let mut state = self.state.lock().expect("adapter queue state poisoned");
            state.running = None;
            if state.history.len() == HISTORY_CAPACITY {
                state.history.pop_front();
            }
            state.history.push_back(HistoryEntry { task_id: gid, trigger_time_us: trigger_time, complete_time_us: complete_time });
        }
        task.base().dec_delete_ref();
    }

    /// Formats the executing task, optional history, and per-priority
    /// lane lengths. Returns the formatted string rather than writing
    /// into a caller buffer — `runtime.rs` truncates to the caller's
    /// `len` and returns the byte count or `-1`, matching the
    /// C-ABI-shaped contract at the edge.
    pub fn dump(&self, tag: &str, include_history: bool) -> String {
        let state = self.state.lock().expect("adapter queue state poisoned");
        let mut out = format!("[{tag}] queue={}\n", self.id);
        match &state.running {
            Some(r) => out.push_str(&format!("running: task={} since={}us\n", r.task_id, r.start_time_us)),
            None => out.push_str("running: <idle>\n"),
        }
        for p in AdapterPriority::iter_high_to_low() {
            out.push_str(&format!("lane[{p:?}]: {}\n", state.lanes[p as usize].len()));
        }
        if include_history {
            out.push_str("history:\n");
            for entry in state.history.iter() {
                out.push_str(&format!(
                    "  task={} trigger={}us complete={}us\n",
                    entry.task_id, entry.trigger_time_us, entry.complete_time_us
                ));
            }
        }
        out
    }

    pub fn dump_size(&self, priority: AdapterPriority) -> usize {
        self.state.lock().expect("adapter queue state poisoned").lanes[priority as usize].len()
    }
}

impl QueueOps for EventHandlerAdapter {
    fn queue_id(&self) -> u32 {
        self.id
    }

    fn queue_type(&self) -> QueueType {
        QueueType::EventHandlerAdapter
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock().expect("adapter queue state poisoned");
        state.running.is_none() && state.lanes.iter().all(WhenMap::is_empty)
    }

    fn has_task(&self, pattern: &Regex) -> bool {
        self.state.lock().expect("adapter queue state poisoned").lanes.iter().any(|l| l.has_task(pattern))
    }

    fn cancel_all(&self) {
        let mut state = self.state.lock().expect("adapter queue state poisoned");
        for lane in state.lanes.iter_mut() {
            for task in lane.remove_all() {
                task.base().mark_exited();
                task.base().dec_delete_ref();
            }
        }
        self.is_exit.store(true, Ordering::Release);
    }

    fn cancel_by_name(&self, pattern: &Regex) -> bool {
        let mut state = self.state.lock().expect("adapter queue state poisoned");
        let mut any = false;
        for lane in state.lanes.iter_mut() {
            for task in lane.remove_matching(pattern) {
                any = true;
                task.base().mark_exited();
                task.base().dec_delete_ref();
            }
        }
        any
    }

    fn cancel_task(&self, id: TaskId) -> bool {
        let mut state = self.state.lock().expect("adapter queue state poisoned");
        for lane in state.lanes.iter_mut() {
            if let Some(task) = lane.remove_task(id) {
                task.base().mark_exited();
                task.base().dec_delete_ref();
                return true;
            }
        }
        false
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
