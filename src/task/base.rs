//! `TaskBase`: the fields and lifecycle shared by every task variant.
//!
//! Identity and status use a monotonic id counter plus status packed
//! into an `AtomicUsize`, generalized here to a richer state machine
//! and a pair of independent ref-counts (task lifetime vs. join
//! waiters). This struct sits behind a plain enum in `task/mod.rs`
//! rather than a trait-object hierarchy, since the three task variants
//! differ only in a handful of extra fields, not in behavior.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::coroutine::engine::Coroutine;
use crate::error::{FlowrtError, FlowrtResult};
use crate::qos::QoS;

static GID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Monotonically unique task identifier (`gid`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new() -> Self {
        Self(GID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Scheduling state and its legal transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TaskState {
    Pending = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    Exited = 4,
}

impl TaskState {
    fn from_raw(v: usize) -> Self {
        match v {
            0 => TaskState::Pending,
            1 => TaskState::Ready,
            2 => TaskState::Running,
            3 => TaskState::Blocked,
            _ => TaskState::Exited,
        }
    }
}

/// Coroutine sub-state tracked alongside the task's scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CoroutineStatus {
    Uninitialized = 0,
    Running = 1,
    NotFinish = 2,
}

impl CoroutineStatus {
    fn from_raw(v: usize) -> Self {
        match v {
            0 => CoroutineStatus::Uninitialized,
            1 => CoroutineStatus::Running,
            _ => CoroutineStatus::NotFinish,
        }
    }
}

/// `COROUTINE` blocks cooperatively via `co_wait`; `THREAD` blocks the
/// OS worker thread itself (legacy compatibility mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Coroutine,
    Thread,
}

/// The user closure plus any one-shot teardown the task variant wants
/// run alongside it. Rust's ownership rules make a pointer-offset trick
/// for recovering the owning task unnecessary: callback sites instead
/// capture `Arc<TaskBase>` directly in the closure's environment.
pub type TaskBody = Box<dyn FnOnce() + Send>;

/// Fields shared by every task variant.
pub struct TaskBase {
    gid: TaskId,
    qos: AtomicI32,
    state: AtomicUsize,
    status: AtomicUsize,
    parent: Option<TaskId>,
    child_count: AtomicUsize,
    delete_ref: AtomicUsize,
    wait_ref: AtomicUsize,
    coroutine: Mutex<Option<Coroutine>>,
    func_storage: Mutex<Option<TaskBody>>,
    trace_tag: Mutex<Vec<String>>,
    block_type: BlockType,
    label: Option<String>,
}

impl TaskBase {
    pub fn new(qos: QoS, parent: Option<TaskId>, block_type: BlockType, body: TaskBody, label: Option<String>) -> Self {
        Self {
            gid: TaskId::new(),
            qos: AtomicI32::new(qos.index() as i32),
            state: AtomicUsize::new(TaskState::Pending as usize),
            status: AtomicUsize::new(CoroutineStatus::Uninitialized as usize),
            parent,
            child_count: AtomicUsize::new(0),
            // One ref for the creator, one implicit ref held by the
            // scheduler while the task is reachable from any queue.
            delete_ref: AtomicUsize::new(1),
            wait_ref: AtomicUsize::new(0),
            coroutine: Mutex::new(None),
            func_storage: Mutex::new(Some(body)),
            trace_tag: Mutex::new(Vec::new()),
            block_type,
            label,
        }
    }

    pub fn gid(&self) -> TaskId {
        self.gid
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn qos(&self) -> QoS {
        QoS::from_index(self.qos.load(Ordering::Acquire) as usize).unwrap_or_default()
    }

    pub fn set_qos(&self, qos: QoS) {
        self.qos.store(qos.index() as i32, Ordering::Release);
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state as usize, Ordering::Release);
    }

    pub fn status(&self) -> CoroutineStatus {
        CoroutineStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: CoroutineStatus) {
        self.status.store(status as usize, Ordering::Release);
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    pub fn child_count(&self) -> usize {
        self.child_count.load(Ordering::Relaxed)
    }

    pub fn inc_child(&self) -> usize {
        self.child_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn dec_child(&self) -> usize {
        self.child_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// `IncDeleteRef`/`DecDeleteRef` govern the task's memory lifetime,
    /// independent of join waiters.
    pub fn inc_delete_ref(&self) -> usize {
        self.delete_ref.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns `true` if this was the last delete-ref (caller must free
    /// the task).
    pub fn dec_delete_ref(&self) -> bool {
        self.delete_ref.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn inc_wait_ref(&self) -> usize {
        self.wait_ref.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn dec_wait_ref(&self) -> usize {
        self.wait_ref.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn wait_ref_count(&self) -> usize {
        self.wait_ref.load(Ordering::Acquire)
    }

    /// `PENDING -> READY` (deps satisfied or explicit `co_wake`).
    pub fn mark_ready(&self) -> FlowrtResult<()> {
        match self.state() {
            TaskState::Pending | TaskState::Blocked => {
                self.set_state(TaskState::Ready);
                Ok(())
            }
            other => Err(FlowrtError::state_violation(format!(
                "mark_ready on {} from state {other:?}",
                self.gid
            ))),
        }
    }

    /// `READY -> RUNNING` (worker picks up).
    pub fn mark_running(&self) -> FlowrtResult<()> {
        if self.state() != TaskState::Ready {
            return Err(FlowrtError::state_violation(format!(
                "mark_running on {} from state {:?}",
                self.gid,
                self.state()
            )));
        }
        self.set_state(TaskState::Running);
        Ok(())
    }

    /// `RUNNING -> BLOCKED` (`co_wait` predicate returned true).
    pub fn mark_blocked(&self) -> FlowrtResult<()> {
        if self.state() != TaskState::Running {
            return Err(FlowrtError::state_violation(format!(
                "mark_blocked on {} from state {:?}",
                self.gid,
                self.state()
            )));
        }
        self.set_state(TaskState::Blocked);
        Ok(())
    }

    /// `RUNNING -> EXITED` (return from `Execute`).
    pub fn mark_exited(&self) {
        self.set_state(TaskState::Exited);
    }

    pub fn take_body(&self) -> Option<TaskBody> {
        self.func_storage.lock().expect("func_storage poisoned").take()
    }

    pub fn push_trace_tag(&self, tag: impl Into<String>) {
        self.trace_tag.lock().expect("trace_tag poisoned").push(tag.into());
    }

    pub fn pop_trace_tag(&self) -> Option<String> {
        self.trace_tag.lock().expect("trace_tag poisoned").pop()
    }

    pub fn trace_snapshot(&self) -> Vec<String> {
        self.trace_tag.lock().expect("trace_tag poisoned").clone()
    }

    /// Bind a freshly allocated or previously-owned coroutine exclusively
    /// to this task: a coroutine is exclusively owned by at most one
    /// task at a time.
    pub fn bind_coroutine(&self, co: Coroutine) -> FlowrtResult<()> {
        let mut slot = self.coroutine.lock().expect("coroutine poisoned");
        if slot.is_some() {
            return Err(FlowrtError::state_violation(format!(
                "task {} already has a bound coroutine",
                self.gid
            )));
        }
        *slot = Some(co);
        Ok(())
    }

    pub fn take_coroutine(&self) -> Option<Coroutine> {
        self.coroutine.lock().expect("coroutine poisoned").take()
    }

    pub fn has_coroutine(&self) -> bool {
        self.coroutine.lock().expect("coroutine poisoned").is_some()
    }
}

impl fmt::Debug for TaskBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBase")
            .field("gid", &self.gid)
            .field("qos", &self.qos())
            .field("state", &self.state())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task() -> TaskBase {
        TaskBase::new(QoS::Default, None, BlockType::Coroutine, Box::new(|| {}), None)
    }

    #[test]
    fn fresh_task_starts_pending_uninitialized() {
        let task = new_task();
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.status(), CoroutineStatus::Uninitialized);
        assert_eq!(task.wait_ref_count(), 0);
    }

    #[test]
    fn normal_state_machine_happy_path() {
        let task = new_task();
        task.mark_ready().unwrap();
        task.mark_running().unwrap();
        task.mark_blocked().unwrap();
        task.mark_ready().unwrap();
        task.mark_running().unwrap();
        task.mark_exited();
        assert_eq!(task.state(), TaskState::Exited);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let task = new_task();
        assert!(task.mark_running().is_err());
        assert!(task.mark_blocked().is_err());
    }

    #[test]
    fn delete_ref_reaches_zero_exactly_once() {
        let task = new_task();
        task.inc_delete_ref();
        assert!(!task.dec_delete_ref());
        assert!(task.dec_delete_ref());
    }

    #[test]
    fn func_storage_is_taken_once() {
        let task = new_task();
        assert!(task.take_body().is_some());
        assert!(task.take_body().is_none());
    }
}
