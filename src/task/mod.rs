//! Task base and subtypes.
//!
//! Tagged-variant-over-inheritance: [`Task`] is a plain enum over the
//! three concrete task structs rather than a trait object hierarchy,
//! keeping a single shared `TaskBase` with a variant tag instead of
//! duplicating the base fields per struct.

pub mod base;
pub mod io_executor;
pub mod normal;
pub mod queue_task;
pub mod wait;

use std::sync::Arc;

pub use base::{BlockType, CoroutineStatus, TaskBase, TaskBody, TaskId, TaskState};
pub use io_executor::IoExecutorTask;
pub use normal::NormalTask;
pub use queue_task::{AdapterPriority, QueueTask};
pub use wait::wait_fd;

/// A handle to any one of the three task variants.
#[derive(Clone)]
pub enum Task {
    Normal(Arc<NormalTask>),
    Queue(Arc<QueueTask>),
    IoExecutor(Arc<IoExecutorTask>),
}

impl Task {
    pub fn base(&self) -> &TaskBase {
        match self {
            Task::Normal(t) => t.base(),
            Task::Queue(t) => t.base(),
            Task::IoExecutor(t) => t.base(),
        }
    }

    pub fn gid(&self) -> TaskId {
        self.base().gid()
    }
}
