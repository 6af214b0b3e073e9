//! External interface surface: the `Runtime` facade wires the
//! scheduler, monitors, worker manager and queue/loop layer into the
//! submit/queue/loop/dump operations a caller sees, translating
//! internal [`FlowrtResult`]s to plain bool/int/Option codes at the ABI
//! boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;

use crate::config::RuntimeConfig;
use crate::dump::{self, DumpKind, QueueSummary};
use crate::error::{FlowrtError, FlowrtResult};
use crate::execute_unit::ExecuteUnit;
use crate::loop_::{Loop, LoopableQueue};
use crate::qos::QoS;
use crate::queue::concurrent::ConcurrentQueue;
use crate::queue::eventhandler::{EventHandlerAdapter, EventHandlerInteractive};
use crate::queue::serial::SerialQueue;
use crate::queue::{now_us, QueueAttr, QueueOps, QueueType, TaskAttr};
use crate::task::{AdapterPriority, NormalTask, Task, TaskBody, TaskId};
use crate::watchdog::DelayedWakeService;

/// A submitted queue task's identity, opaque to the caller beyond
/// `queue_cancel`. Carries the owning queue id so `queue_cancel` doesn't
/// need a separate queue argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTaskHandle {
    pub queue_id: u32,
    pub task_id: TaskId,
}

/// Owns one constructed queue variant; the common [`QueueOps`] trait
/// object covers cancel/idle/has_task/dump-size plumbing, while
/// `submit` needs the concrete type since each variant's `submit`
/// signature differs only in which extra fields (`priority`) apply.
enum QueueHandle {
    Serial(Arc<SerialQueue>),
    Concurrent(Arc<ConcurrentQueue>),
    EventHandlerInteractive(Arc<EventHandlerInteractive>),
    EventHandlerAdapter(Arc<EventHandlerAdapter>),
}

impl QueueHandle {
    fn ops(&self) -> &dyn QueueOps {
        match self {
            QueueHandle::Serial(q) => q.as_ref(),
            QueueHandle::Concurrent(q) => q.as_ref(),
            QueueHandle::EventHandlerInteractive(q) => q.as_ref(),
            QueueHandle::EventHandlerAdapter(q) => q.as_ref(),
        }
    }

    fn submit(&self, body: TaskBody, attr: TaskAttr) -> FlowrtResult<TaskId> {
        match self {
            QueueHandle::Serial(q) => q.submit(body, attr),
            QueueHandle::Concurrent(q) => q.submit(body, attr),
            QueueHandle::EventHandlerInteractive(q) => q.submit(body, attr),
            QueueHandle::EventHandlerAdapter(q) => q.submit(body, attr),
        }
    }

    /// Only the concurrent-shaped variants integrate with a [`Loop`].
    fn as_loopable(&self) -> Option<LoopableQueue> {
        match self {
            QueueHandle::Concurrent(q) => Some(LoopableQueue::Concurrent(Arc::clone(q))),
            QueueHandle::EventHandlerInteractive(q) => Some(LoopableQueue::EventHandlerInteractive(Arc::clone(q))),
            _ => None,
        }
    }

    fn as_adapter(&self) -> Option<&Arc<EventHandlerAdapter>> {
        match self {
            QueueHandle::EventHandlerAdapter(q) => Some(q),
            _ => None,
        }
    }
}

/// The process-wide runtime facade. Construct one per process (or use
/// [`crate::execute_unit::global`] for an ambient singleton) and drive
/// every submission/queue/loop/dump operation through it.
pub struct Runtime {
    pub unit: Arc<ExecuteUnit>,
    queues: Mutex<HashMap<u32, QueueHandle>>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self { unit: ExecuteUnit::new(config), queues: Mutex::new(HashMap::new()) })
    }

    pub fn with_execute_unit(unit: Arc<ExecuteUnit>) -> Arc<Self> {
        Arc::new(Self { unit, queues: Mutex::new(HashMap::new()) })
    }

    // ---- Task submission API -------------------------------------------

    /// `submit(func, attr)`: enqueue directly onto the global scheduler,
    /// bypassing every queue handler. Fire-and-forget; the returned id
    /// is only useful for logging since there is no queue to cancel
    /// through.
    pub fn submit(&self, body: TaskBody, attr: TaskAttr) -> FlowrtResult<()> {
        self.submit_h(body, attr).map(|_| ())
    }

    /// `submit_h(func, attr) -> handle`.
    pub fn submit_h(&self, body: TaskBody, attr: TaskAttr) -> FlowrtResult<TaskId> {
        let qos = QoS::normalize(attr.qos_raw, QoS::Default)?;
        let task = NormalTask::spawn(qos, None, attr.label.clone(), body);
        let gid = task.base().gid();
        let scheduler = Arc::clone(&self.unit.scheduler);
        let monitor = Arc::clone(&self.unit.monitor);
        let notify_worker = attr.notify_worker;
        let enqueue = move || {
            if notify_worker {
                scheduler.wakeup(qos, Task::Normal(task), &monitor);
            } else {
                scheduler.insert(qos, Task::Normal(task));
            }
        };
        if attr.delay_us == 0 {
            enqueue();
        } else {
            let deadline = now_us() + attr.delay_us;
            DelayedWakeService::global().schedule_at(deadline, enqueue);
        }
        Ok(gid)
    }

    // ---- Queue lifecycle ----------------------------------------------

    /// `queue_create(type, name, attr) -> queue`. `name` is carried only
    /// for diagnostics (`dump`); it plays no role in submission or
    /// lookup.
    pub fn queue_create(&self, queue_type: QueueType, _name: Option<&str>, attr: QueueAttr) -> FlowrtResult<u32> {
        let scheduler = Arc::clone(&self.unit.scheduler);
        let monitor = Arc::clone(&self.unit.monitor);
        let queue_monitor = Arc::clone(&self.unit.queue_monitor);
        let handle = match queue_type {
            QueueType::Serial => QueueHandle::Serial(SerialQueue::new(attr, scheduler, monitor, queue_monitor)),
            QueueType::Concurrent => QueueHandle::Concurrent(ConcurrentQueue::new(attr, scheduler, monitor, queue_monitor)),
            QueueType::EventHandlerInteractive => {
                QueueHandle::EventHandlerInteractive(EventHandlerInteractive::new(attr, scheduler, monitor, queue_monitor))
            }
            QueueType::EventHandlerAdapter => QueueHandle::EventHandlerAdapter(EventHandlerAdapter::new(attr, scheduler, monitor, queue_monitor)),
        };
        let id = handle.ops().queue_id();
        self.queues.lock().expect("queue registry poisoned").insert(id, handle);
        Ok(id)
    }

    /// `queue_destroy(queue)`: cancels everything pending, waits for any
    /// in-flight dispatch, then drops the queue from the registry.
    pub fn queue_destroy(&self, queue_id: u32) -> bool {
        let handle = self.queues.lock().expect("queue registry poisoned").remove(&queue_id);
        match handle {
            Some(handle) => {
                handle.ops().cancel_and_wait();
                true
            }
            None => false,
        }
    }

    fn with_queue<R>(&self, queue_id: u32, f: impl FnOnce(&QueueHandle) -> R) -> Option<R> {
        self.queues.lock().expect("queue registry poisoned").get(&queue_id).map(f)
    }

    // ---- Queue submission -----------------------------------------------

    pub fn queue_submit(&self, queue_id: u32, body: TaskBody, attr: TaskAttr) -> FlowrtResult<()> {
        self.queue_submit_h(queue_id, body, attr).map(|_| ())
    }

    pub fn queue_submit_h(&self, queue_id: u32, body: TaskBody, attr: TaskAttr) -> FlowrtResult<QueueTaskHandle> {
        let task_id = self
            .with_queue(queue_id, |h| h.submit(body, attr))
            .ok_or_else(|| FlowrtError::invalid_argument(format!("unknown queue {queue_id}")))??;
        Ok(QueueTaskHandle { queue_id, task_id })
    }

    pub fn queue_submit_head(&self, queue_id: u32, body: TaskBody, mut attr: TaskAttr) -> FlowrtResult<()> {
        attr.submit_head = true;
        self.queue_submit(queue_id, body, attr)
    }

    pub fn queue_submit_head_h(&self, queue_id: u32, body: TaskBody, mut attr: TaskAttr) -> FlowrtResult<QueueTaskHandle> {
        attr.submit_head = true;
        self.queue_submit_h(queue_id, body, attr)
    }

    // ---- Cancellation ---------------------------------------------------

    /// `queue_cancel(handle)`: targeted cancel by task id; fails if the
    /// task has already been dispatched.
    pub fn queue_cancel(&self, handle: QueueTaskHandle) -> bool {
        self.with_queue(handle.queue_id, |h| h.ops().cancel_task(handle.task_id)).unwrap_or(false)
    }

    pub fn queue_cancel_all(&self, queue_id: u32) -> bool {
        self.with_queue(queue_id, |h| h.ops().cancel_all()).is_some()
    }

    /// `queue_cancel_by_name(queue, name) -> 0|1`, exposed as `bool`.
    pub fn queue_cancel_by_name(&self, queue_id: u32, name_pattern: &str) -> FlowrtResult<bool> {
        let re = Regex::new(name_pattern).map_err(|e| FlowrtError::invalid_argument(format!("bad pattern {name_pattern:?}: {e}")))?;
        Ok(self.with_queue(queue_id, |h| h.ops().cancel_by_name(&re)).unwrap_or(false))
    }

    // ---- Queries ---------------------------------------------------------

    pub fn queue_has_task(&self, queue_id: u32, name_pattern: &str) -> FlowrtResult<bool> {
        let re = Regex::new(name_pattern).map_err(|e| FlowrtError::invalid_argument(format!("bad pattern {name_pattern:?}: {e}")))?;
        Ok(self.with_queue(queue_id, |h| h.ops().has_task(&re)).unwrap_or(false))
    }

    pub fn queue_is_idle(&self, queue_id: u32) -> bool {
        self.with_queue(queue_id, |h| h.ops().is_idle()).unwrap_or(true)
    }

    // ---- Dump (adapter variant only, `dump`/`dump_size`) ----------------

    pub fn queue_dump(&self, queue_id: u32, tag: &str, include_history: bool, buf: &mut [u8]) -> i32 {
        let text = match self.with_queue(queue_id, |h| h.as_adapter().map(|a| a.dump(tag, include_history))) {
            Some(Some(text)) => text,
            _ => return -1,
        };
        dump::write_truncated(&text, buf)
    }

    pub fn queue_size_dump(&self, queue_id: u32, priority: AdapterPriority) -> i32 {
        match self.with_queue(queue_id, |h| h.as_adapter().map(|a| a.dump_size(priority))) {
            Some(Some(n)) => n as i32,
            _ => -1,
        }
    }

    // ---- Loop API ----------------------------------------------------------

    /// `loop_create(queue) -> loop`: only the concurrent-shaped variants
    /// (`concurrent`, `eventhandler_interactive`) support this.
    pub fn loop_create(&self, queue_id: u32) -> FlowrtResult<Arc<Loop>> {
        let loopable = self
            .with_queue(queue_id, |h| h.as_loopable())
            .flatten()
            .ok_or_else(|| FlowrtError::invalid_argument(format!("queue {queue_id} does not support loop integration")))?;
        Loop::create(loopable)
    }

    // ---- Dump command (`ffrt_dump`) -----------------------------------------

    pub fn dump(&self, kind: DumpKind, buf: &mut [u8]) -> i32 {
        let queues = self.queues.lock().expect("queue registry poisoned");
        let summaries: Vec<QueueSummary> = queues
            .values()
            .map(|h| QueueSummary { id: h.ops().queue_id(), queue_type: h.ops().queue_type(), is_idle: h.ops().is_idle() })
            .collect();
        drop(queues);
        dump::ffrt_dump(kind, &self.unit, &summaries, buf)
    }

    pub fn shutdown(&self, join_timeout: Duration) {
        self.unit.teardown(join_timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn top_level_submit_runs_on_a_worker() {
        let rt = Runtime::new(RuntimeConfig::default());
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        rt.submit(Box::new(move || { r.fetch_add(1, Ordering::SeqCst); }), TaskAttr::default()).expect("submit");
        for _ in 0..200 {
            if ran.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        rt.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn serial_queue_round_trip() {
        let rt = Runtime::new(RuntimeConfig::default());
        let id = rt.queue_create(QueueType::Serial, Some("test-serial"), QueueAttr::default()).expect("create");
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let handle = rt
            .queue_submit_h(id, Box::new(move || { r.fetch_add(1, Ordering::SeqCst); }), TaskAttr::default())
            .expect("submit");
        assert_eq!(handle.queue_id, id);
        for _ in 0..200 {
            if rt.queue_is_idle(id) && ran.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(rt.queue_destroy(id));
        rt.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn cancel_before_dispatch_succeeds() {
        let rt = Runtime::new(RuntimeConfig::default());
        let id = rt.queue_create(QueueType::Serial, None, QueueAttr::default()).expect("create");
        let handle = rt
            .queue_submit_h(id, Box::new(|| {}), TaskAttr { delay_us: 5_000_000, ..Default::default() })
            .expect("submit");
        assert!(rt.queue_cancel(handle));
        rt.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn unknown_queue_operations_report_failure() {
        let rt = Runtime::new(RuntimeConfig::default());
        assert!(!rt.queue_destroy(9999));
        assert!(rt.queue_is_idle(9999));
        assert!(matches!(rt.queue_submit(9999, Box::new(|| {}), TaskAttr::default()), Err(_)));
        rt.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn adapter_dump_reports_lane_sizes() {
        let rt = Runtime::new(RuntimeConfig::default());
        let id = rt.queue_create(QueueType::EventHandlerAdapter, None, QueueAttr::default()).expect("create");
        rt.queue_submit(
            id,
            Box::new(|| std::thread::sleep(Duration::from_millis(50))),
            TaskAttr { priority: Some(AdapterPriority::Vip), ..Default::default() },
        )
        .expect("submit");
        let mut buf = [0u8; 2048];
        let n = rt.queue_dump(id, "test", false, &mut buf);
        assert!(n > 0);
        assert_eq!(rt.queue_size_dump(id, AdapterPriority::Idle), 0);
        rt.shutdown(Duration::from_secs(1));
    }
}
