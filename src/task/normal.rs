//! `normal_task` variant: a user-submitted task, live until its final
//! delete-ref drop, run entirely through the coroutine engine.

use std::sync::Arc;

use super::base::{BlockType, TaskBase, TaskBody, TaskId};
use crate::qos::QoS;

pub struct NormalTask {
    base: TaskBase,
}

impl NormalTask {
    pub fn spawn(qos: QoS, parent: Option<TaskId>, label: Option<String>, body: TaskBody) -> Arc<Self> {
        Arc::new(Self {
            base: TaskBase::new(qos, parent, BlockType::Coroutine, body, label),
        })
    }

    pub fn base(&self) -> &TaskBase {
        &self.base
    }
}
