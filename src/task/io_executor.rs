//! `io_executor_task` variant: runs a native closure on the calling
//! thread without ever allocating a coroutine — used for short
//! callbacks where the cost of a stack switch isn't worth it (poller
//! user-callbacks, queue timeout callbacks).

use std::sync::Arc;

use super::base::{BlockType, TaskBase, TaskBody, TaskId};
use crate::error::FlowrtResult;
use crate::qos::QoS;

pub struct IoExecutorTask {
    base: TaskBase,
}

impl IoExecutorTask {
    pub fn new(qos: QoS, parent: Option<TaskId>, label: Option<String>, body: TaskBody) -> Arc<Self> {
        Arc::new(Self {
            base: TaskBase::new(qos, parent, BlockType::Thread, body, label),
        })
    }

    pub fn base(&self) -> &TaskBase {
        &self.base
    }

    /// Run the stored closure synchronously on the calling thread. No
    /// coroutine is allocated; `state` goes straight `PENDING -> RUNNING
    /// -> EXITED` without ever touching `status`.
    pub fn run(&self) -> FlowrtResult<()> {
        self.base.mark_ready()?;
        self.base.mark_running()?;
        if let Some(body) = self.base.take_body() {
            body();
        }
        self.base.mark_exited();
        self.base.dec_delete_ref();
        Ok(())
    }
}
