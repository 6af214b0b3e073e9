//! `queue_task` variant: submitted through a queue handler, carries a
//! delivery deadline (`uptime`) and, for the adapter variant, a priority
//! level.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::base::{BlockType, TaskBase, TaskBody};
use crate::qos::QoS;

/// Adapter-variant priority levels: `vip` is never suppressed by the
/// QoS monitor even when other levels are throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AdapterPriority {
    Vip = 0,
    Immediate = 1,
    High = 2,
    Low = 3,
    Idle = 4,
}

impl AdapterPriority {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Vip),
            1 => Some(Self::Immediate),
            2 => Some(Self::High),
            3 => Some(Self::Low),
            4 => Some(Self::Idle),
            _ => None,
        }
    }

    pub fn iter_high_to_low() -> impl Iterator<Item = AdapterPriority> {
        [Self::Vip, Self::Immediate, Self::High, Self::Low, Self::Idle].into_iter()
    }
}

pub struct QueueTask {
    base: TaskBase,
    queue_id: u32,
    uptime_us: AtomicU64,
    priority: Option<AdapterPriority>,
    timeout_us: u64,
}

impl QueueTask {
    pub fn new(
        qos: QoS,
        queue_id: u32,
        label: Option<String>,
        body: TaskBody,
        uptime_us: u64,
        priority: Option<AdapterPriority>,
        timeout_us: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: TaskBase::new(qos, None, BlockType::Coroutine, body, label),
            queue_id,
            uptime_us: AtomicU64::new(uptime_us),
            priority,
            timeout_us,
        })
    }

    pub fn base(&self) -> &TaskBase {
        &self.base
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn uptime_us(&self) -> u64 {
        self.uptime_us.load(Ordering::Acquire)
    }

    pub fn priority(&self) -> Option<AdapterPriority> {
        self.priority
    }

    pub fn timeout_us(&self) -> u64 {
        self.timeout_us
    }

    pub fn matches_label(&self, pattern: &regex::Regex) -> bool {
        self.base.label().map(|l| pattern.is_match(l)).unwrap_or(false)
    }
}
