//! `WaitFdEvent(fd, events)`: the one task-facing primitive that
//! actually suspends a task on an fd,
//! wiring `co_wait`/`co_wake`, `Scheduler::park`/`unpark`, and the
//! poller's cached-events fast path together. Everything else in
//! `coroutine::engine` and `sched::Scheduler` is plumbing this function
//! drives.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::coroutine::{co_wait, co_wake};
use crate::coroutine::switch;
use crate::error::{FlowrtError, FlowrtResult};
use crate::poller::{CtlOp, FdWaitSlot, Registration};
use crate::worker::thread::current_handles;

use super::base::BlockType;

/// Block the calling task until `fd` becomes ready for (any bit of)
/// `events`, returning the fired event mask. If a prior `poll_once`
/// already observed and cached an event for this task (the event beat
/// the task to the wait call), returns immediately from the cache
/// instead of parking at all (the "cached events" fast path).
///
/// Must be called from inside a task body running on a CPU worker
/// thread.
pub fn wait_fd(fd: RawFd, events: u32) -> FlowrtResult<u32> {
    let handles = current_handles().ok_or_else(|| FlowrtError::state_violation("wait_fd called off a worker thread"))?;
    let task_ptr = switch::with_env(|env| env.running_task())
        .ok_or_else(|| FlowrtError::state_violation("wait_fd called outside a running coroutine"))?;
    // SAFETY: `task_ptr` is the task this coroutine is running as,
    // pinned for the duration of the surrounding `co_start` call by the
    // caller's own `Arc` (see `coroutine::engine::co_start`'s doc
    // comment); this function only runs synchronously within that
    // window.
    let task_base = unsafe { task_ptr.as_ref() };
    let key = task_base.gid().as_u64() as usize;

    if let Some(cached) = handles.poller.take_cached_events(key) {
        handles.poller.unmask_fd(fd, events)?;
        return Ok(merge_events(cached));
    }

    handles.poller.add_fd_event(CtlOp::Add, events, fd, Registration::TaskWait { key })?;

    let fired = match task_base.block_type() {
        BlockType::Thread => wait_fd_thread(&handles.poller, key),
        BlockType::Coroutine => wait_fd_coroutine(task_base, &handles, key),
    };

    handles.poller.del_fd_event(fd).ok();
    Ok(fired)
}

fn merge_events(events: Vec<u32>) -> u32 {
    events.into_iter().fold(0, |acc, e| acc | e)
}

/// Legacy OS-thread blocking mode: park the real thread on a condvar
/// until `poll_once` (on some other worker) delivers the event.
fn wait_fd_thread(poller: &Arc<crate::poller::Poller>, key: usize) -> u32 {
    let slot = FdWaitSlot::new();
    let slot_wake = Arc::clone(&slot);
    poller.arm_waiter(key, Arc::new(move |ev| slot_wake.wake(ev)));
    slot.wait_blocking(None).unwrap_or(0)
}

/// Cooperative coroutine blocking mode: `co_wait` yields the coroutine
/// back to the worker, which parks the task in the scheduler's parked
/// table once `co_start`'s inner loop sees the `Parked` outcome. The
/// predicate below arms the poller waiter for
/// `key` from the worker side, immediately after switch-out and before
/// the worker moves on to park the task — so by the time an event can
/// possibly fire, the waiter is already armed.
fn wait_fd_coroutine(task_base: &crate::task::TaskBase, handles: &crate::worker::thread::WorkerRuntimeHandles, key: usize) -> u32 {
    let gid = task_base.gid();
    let qos = handles.qos;
    let scheduler = Arc::clone(&handles.scheduler);
    let monitor = Arc::clone(&handles.monitor);
    let poller = Arc::clone(&handles.poller);

    co_wait(
        task_base,
        Box::new(move |_task_ptr| {
            let scheduler = Arc::clone(&scheduler);
            let monitor = Arc::clone(&monitor);
            let poller_wake = Arc::clone(&poller);
            poller.arm_waiter(
                key,
                Arc::new(move |ev| {
                    poller_wake.cache_event(key, ev);
                    if let Some(task) = scheduler.unpark(gid) {
                        let _ = co_wake(task.base(), false);
                        scheduler.wakeup(qos, task, &monitor);
                    }
                }),
            );
            true
        }),
    );

    // Resumed: the runtime has already run `co_wake` and re-dispatched
    // this task through the scheduler by the time control returns here,
    // so the fired event is waiting in the cache.
    handles.poller.take_cached_events(key).map(merge_events).unwrap_or(0)
}
