//! `ffrt_dump`: formats a snapshot of process-wide runtime state into a
//! caller-provided buffer. Follows the same split as the adapter
//! queue's own `dump`/`dump_size`
//! (`queue::eventhandler::EventHandlerAdapter::dump`): the queue/
//! monitor layers build plain `String`s, and this module (mirrored by
//! `runtime.rs` for the per-queue variants) does the one C-ABI-shaped
//! truncate-into-buf step.

use crate::execute_unit::ExecuteUnit;
use crate::qos::QoS;
use crate::queue::QueueType;

/// `DUMP_INFO_ALL` / `DUMP_TASK_STATISTIC_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    InfoAll,
    TaskStatisticInfo,
}

/// A queue's identity and liveness as seen from outside the queue
/// itself; `runtime.rs` gathers these from its queue registry since
/// `dump.rs` has no registry of its own to walk.
#[derive(Debug, Clone, Copy)]
pub struct QueueSummary {
    pub id: u32,
    pub queue_type: QueueType,
    pub is_idle: bool,
}

fn queue_type_tag(t: QueueType) -> &'static str {
    match t {
        QueueType::Serial => "serial",
        QueueType::Concurrent => "concurrent",
        QueueType::EventHandlerInteractive => "eventhandler_interactive",
        QueueType::EventHandlerAdapter => "eventhandler_adapter",
    }
}

fn format_task_statistic_info(unit: &ExecuteUnit) -> String {
    let mut out = String::from("task statistic info:\n");
    for qos in QoS::iter_all() {
        let group = unit.monitor.group(qos);
        out.push_str(&format!(
            "  qos={qos}: executing={} sleeping={} deep_sleeping={} total={} hard_limit={}\n",
            group.executing(),
            group.sleeping(),
            group.deep_sleeping(),
            group.total(),
            group.hard_limit(),
        ));
    }
    out
}

fn format_info_all(unit: &ExecuteUnit, queues: &[QueueSummary]) -> String {
    let mut out = format_task_statistic_info(unit);
    out.push_str("queues:\n");
    if queues.is_empty() {
        out.push_str("  <none>\n");
    }
    for q in queues {
        out.push_str(&format!("  id={} type={} idle={}\n", q.id, queue_type_tag(q.queue_type), q.is_idle));
    }
    out
}

/// Writes `s` into `buf` if it fits, returning the byte count;
/// otherwise returns `-1` on truncation, matching `error.rs`'s
/// integer-at-the-boundary convention (`StatusCode`) rather than
/// Rust-native `Result` since this is explicitly a C-ABI-shaped call.
pub fn write_truncated(s: &str, buf: &mut [u8]) -> i32 {
    let bytes = s.as_bytes();
    if bytes.len() > buf.len() {
        return -1;
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    bytes.len() as i32
}

/// `ffrt_dump(kind, buf, len)`: formats the requested snapshot and
/// truncates it into `buf`.
pub fn ffrt_dump(kind: DumpKind, unit: &ExecuteUnit, queues: &[QueueSummary], buf: &mut [u8]) -> i32 {
    let text = match kind {
        DumpKind::InfoAll => format_info_all(unit, queues),
        DumpKind::TaskStatisticInfo => format_task_statistic_info(unit),
    };
    write_truncated(&text, buf)
}
