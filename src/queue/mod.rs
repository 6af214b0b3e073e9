//! Queue handlers.
//!
//! Four variants share the submission/pull/dispatch/cancellation shape
//! but differ enough in storage and concurrency that each gets its own
//! small struct rather than one generic core (serial: one in-flight
//! task; concurrent: up to `max_concurrency`; the eventhandler variants
//! add loop-integration and, for the adapter, five priority lanes).

pub mod concurrent;
pub mod eventhandler;
pub mod serial;
pub mod when_map;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::qos::QoS;
use crate::task::{AdapterPriority, TaskId};

static QUEUE_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Globally unique queue id; `0` is reserved invalid.
pub fn next_queue_id() -> u32 {
    QUEUE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

pub fn now_us() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_micros() as u64
}

/// Queue type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Serial = 0,
    Concurrent = 1,
    EventHandlerInteractive = 3,
    EventHandlerAdapter = 4,
}

pub type TimeoutCallback = Arc<dyn Fn(u32, &str) + Send + Sync>;

/// `{qos, timeout_us, timeout_cb, type, max_concurrency, thread_mode}`.
#[derive(Clone)]
pub struct QueueAttr {
    pub qos: QoS,
    pub timeout_us: u64,
    pub timeout_cb: Option<TimeoutCallback>,
    pub max_concurrency: usize,
}

impl Default for QueueAttr {
    fn default() -> Self {
        Self { qos: QoS::Default, timeout_us: 0, timeout_cb: None, max_concurrency: 1 }
    }
}

/// `{qos, priority, delay_us, label, notify_worker, timeout_us,
/// timeout_cb, stack_size, task_local}`. `qos_raw` carries the
/// sentinel-or-concrete value exactly as
/// submitted; callers resolve it with `QoS::normalize` against the
/// queue's own QoS.
#[derive(Clone)]
pub struct TaskAttr {
    pub qos_raw: i32,
    pub priority: Option<AdapterPriority>,
    pub delay_us: u64,
    pub label: Option<String>,
    pub notify_worker: bool,
    pub timeout_us: u64,
    pub timeout_cb: Option<TimeoutCallback>,
    pub stack_size: usize,
    pub submit_head: bool,
}

impl Default for TaskAttr {
    fn default() -> Self {
        Self {
            qos_raw: crate::qos::QOS_INHERIT,
            priority: None,
            delay_us: 0,
            label: None,
            notify_worker: true,
            timeout_us: 0,
            timeout_cb: None,
            stack_size: 0,
            submit_head: false,
        }
    }
}

/// `{task_id, trigger_time, complete_time}`, the adapter variant's
/// bounded history ring entry.
#[derive(Debug, Clone, Copy)]
pub struct HistoryEntry {
    pub task_id: TaskId,
    pub trigger_time_us: u64,
    pub complete_time_us: u64,
}

/// A currently-dispatching task's bookkeeping record, as tracked by the
/// queue monitor (`queues_running_info`).
#[derive(Debug, Clone, Copy)]
pub struct RunningRecord {
    pub queue_id: u32,
    pub task_id: TaskId,
    pub start_time_us: u64,
}

/// Lets the concurrent variant's `Deliver` be routed through an event
/// loop instead of straight back to the scheduler. `loop_.rs`'s `Loop`
/// implements this.
pub trait LoopSink: Send + Sync {
    fn deliver(&self, queue_id: u32);
}

/// Operations common to every queue variant, used by `runtime.rs` and
/// `loop_.rs` so they don't need to match on the concrete variant.
pub trait QueueOps: Send + Sync {
    fn queue_id(&self) -> u32;
    fn queue_type(&self) -> QueueType;
    fn is_idle(&self) -> bool;
    fn has_task(&self, pattern: &regex::Regex) -> bool;
    /// `Remove()`: cancel everything pending, mark exit.
    fn cancel_all(&self);
    /// `Remove(name)`: regex/substring match; true if at least one
    /// task was cancelled.
    fn cancel_by_name(&self, pattern: &regex::Regex) -> bool;
    /// `Remove(task*)`: targeted cancel by id.
    fn cancel_task(&self, id: TaskId) -> bool;
    /// Blocks until the in-flight dispatch (if any) completes, then
    /// cancels everything still pending.
    fn cancel_and_wait(&self);
}
