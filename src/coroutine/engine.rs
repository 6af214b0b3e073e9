//! Coroutine lifecycle: allocation, `co_start`/`co_entry`/`co_yield`/
//! `co_wait`/`co_wake`.

use std::ptr::NonNull;

use context::{Context, Transfer};

use super::stack::{self, CoroutineStack};
use super::switch::{self, PendingPredicate, SwitchOutcome};
use crate::error::FlowrtResult;
use crate::task::base::{CoroutineStatus, TaskBase, TaskState};

/// A coroutine's owned resources: the stack it runs on and (once it has
/// yielded at least once, or before its first resume) the saved
/// register context to resume into. Exclusively owned by at most one
/// task at a time.
pub struct Coroutine {
    stack: CoroutineStack,
    ctx: Option<Context>,
    strong_protect: bool,
}

unsafe impl Send for Coroutine {}

impl Coroutine {
    /// Allocate a fresh, not-yet-started coroutine. Does not protect the
    /// guard page yet — `co_start` does that once the initial `Context`
    /// has been written (see its doc comment).
    pub fn allocate(requested_size: usize, default_size: usize, strong_protect: bool) -> FlowrtResult<Self> {
        let stack = stack::allocate(requested_size, default_size, strong_protect)?;
        Ok(Self { stack, ctx: None, strong_protect })
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn check_canary(&self) {
        self.stack.check_canary(0);
    }
}

/// Trampoline the `context` crate resumes into on a coroutine's very
/// first switch-in. Runs the task's body to completion, marks the task
/// exited, then parks forever yielding back to the scheduler — the
/// stack is never resumed again once `status` returns to
/// `Uninitialized`.
extern "C" fn co_entry_trampoline(t: Transfer) -> ! {
    switch::prime_scheduler_context(t.context);
    let task_ptr = t.data as *mut TaskBase;
    // SAFETY: `co_start` only ever passes a live `TaskBase` pointer
    // that outlives this coroutine's execution window (held by an
    // `Arc` on the worker's stack across the `resume` call).
    let task: &TaskBase = unsafe { &*task_ptr };

    if let Some(body) = task.take_body() {
        body();
    }
    task.mark_exited();
    task.set_status(CoroutineStatus::Uninitialized);

    loop {
        switch::co_yield_to_scheduler();
    }
}

/// `co_start(task)`: bind/reuse a coroutine, switch into it, and loop
/// on the pending-predicate protocol until the task either completes or
/// genuinely parks.
///
/// Takes `&TaskBase` rather than `&Arc<TaskBase>`: the call is
/// synchronous from the caller's point of view (it only returns once
/// the coroutine has either finished or parked), so the caller's own
/// `Arc<NormalTask>`/`Arc<QueueTask>` already keeps the task alive for
/// the whole duration — no extra ref-count bump is needed here.
pub fn co_start(task: &TaskBase, default_stack_size: usize, strong_protect: bool) -> FlowrtResult<SwitchOutcome> {
    task.mark_running()?;

    let mut co = match task.take_coroutine() {
        Some(co) => co,
        None => Coroutine::allocate(0, default_stack_size, strong_protect)?,
    };

    let ctx = match co.ctx.take() {
        Some(ctx) => ctx,
        None => {
            debug_assert_eq!(task.status(), CoroutineStatus::Uninitialized);
            // SAFETY: `co.stack` outlives the returned `Context` — both
            // live inside `co`, which is re-bound to the task (or
            // dropped only after the coroutine has fully exited) before
            // this function returns.
            let ctx = unsafe { Context::new(&co.stack, co_entry_trampoline) };
            // Only safe to mark the guard page read-only *after*
            // `Context::new` has finished writing the initial register
            // frame into the stack's high end; doing this inside
            // `stack::allocate` would fault on that very write.
            if co.strong_protect {
                co.stack.protect_top_page()?;
            }
            ctx
        }
    };

    task.set_status(CoroutineStatus::Running);
    let task_ptr = NonNull::from(task);
    let (returned_ctx, outcome) = switch::co_start(task_ptr, ctx, true);
    co.ctx = Some(returned_ctx);
    co.check_canary();

    match outcome {
        SwitchOutcome::Completed => {
            // The coroutine's stack is free to be reused by a future
            // task; do not rebind it here so the next `co_start` on a
            // different task allocates its own (or the slab recycles
            // this one via `Drop`).
        }
        SwitchOutcome::Parked => {
            task.mark_blocked()?;
            task.bind_coroutine(co)?;
        }
    }
    Ok(outcome)
}

/// `co_yield`: unconditional suspend back to the scheduler context.
/// Only valid from inside a running coroutine.
pub fn co_yield_now(task: &TaskBase) {
    task.set_status(CoroutineStatus::NotFinish);
    switch::co_yield_to_scheduler();
}

/// `co_wait(pred)`: store the wake predicate and yield. `pred` runs on
/// the *worker* side immediately after the switch-out, not inside the
/// coroutine.
pub fn co_wait(task: &TaskBase, pred: PendingPredicate) {
    task.set_status(CoroutineStatus::NotFinish);
    switch::co_wait(pred);
}

/// `co_wake(task, timed_out)`: transition a blocked task back to
/// `READY`. Queue-task variants additionally hand
/// the task back to their owning queue handler; that chaining happens
/// at the call site in `queue::mod`, not here, since this module has no
/// knowledge of queue handlers.
pub fn co_wake(task: &TaskBase, _timed_out: bool) -> FlowrtResult<()> {
    if task.state() == TaskState::Blocked {
        task.mark_ready()?;
    }
    Ok(())
}
