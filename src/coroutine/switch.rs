//! Bidirectional context switching between a worker's scheduler loop
//! and the coroutine it currently has bound, plus the per-worker
//! thread-local environment.
//!
//! Built on the `context` crate's `Context`/`Transfer` pair (the same
//! per-architecture assembly shim family `coio-rs`/`mioco` use): a
//! `resume` call performs the actual register/SP/PC swap and blocks
//! the calling "side" until it is resumed back into.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use context::stack::Stack as ContextStackTrait;
use context::{Context, Transfer};

use super::stack::CoroutineStack;
use crate::task::base::TaskBase;

/// Adapts our allocator-backed [`CoroutineStack`] to the `context`
/// crate's `Stack` trait so it can back a `Context`.
unsafe impl ContextStackTrait for CoroutineStack {
    fn top(&self) -> *mut std::os::raw::c_void {
        CoroutineStack::top(self) as *mut _
    }

    fn bottom(&self) -> *mut std::os::raw::c_void {
        CoroutineStack::bottom(self) as *mut _
    }
}

/// Predicate stored by `co_wait`: returns `true` once the task has been
/// handed off to a synchronisation object (the worker must not free the
/// coroutine), `false` on a fast wake (re-enter the coroutine
/// immediately).
pub type PendingPredicate = Box<dyn FnOnce(NonNull<TaskBase>) -> bool + Send>;

/// Per-worker-thread environment: the register state to resume into
/// the scheduler loop, the currently-bound task/coroutine, and the
/// pending-wait predicate `co_wait` hands to `co_start`'s inner loop.
pub struct WorkerEnv {
    scheduler_ctx: RefCell<Option<Context>>,
    running: Cell<Option<NonNull<TaskBase>>>,
    pending: RefCell<Option<PendingPredicate>>,
    tsd: RefCell<Vec<*mut std::ffi::c_void>>,
}

impl WorkerEnv {
    fn new() -> Self {
        Self {
            scheduler_ctx: RefCell::new(None),
            running: Cell::new(None),
            pending: RefCell::new(None),
            tsd: RefCell::new(Vec::new()),
        }
    }

    pub fn running_task(&self) -> Option<NonNull<TaskBase>> {
        self.running.get()
    }

    /// Swap this worker's pthread-key TSD array for `next`, returning
    /// the array that was previously installed. Empty vectors are the
    /// common case (tasks without task-local storage) and cost nothing
    /// beyond the swap.
    pub fn swap_tsd(&self, next: Vec<*mut std::ffi::c_void>) -> Vec<*mut std::ffi::c_void> {
        self.tsd.replace(next)
    }
}

thread_local! {
    static WORKER_ENV: WorkerEnv = WorkerEnv::new();
}

/// Access the calling thread's worker environment.
pub fn with_env<R>(f: impl FnOnce(&WorkerEnv) -> R) -> R {
    WORKER_ENV.with(f)
}

/// Install `pred` as the wait predicate for the currently-running
/// coroutine, then yield back to the scheduler (`co_wait`). Must only
/// be called from inside a coroutine.
pub fn co_wait(pred: PendingPredicate) {
    WORKER_ENV.with(|env| {
        *env.pending.borrow_mut() = Some(pred);
    });
    co_yield_to_scheduler();
}

/// Suspend the running coroutine unconditionally and return control to
/// the scheduler context (`co_yield`). A bare `co_yield` without
/// `co_wait` implies an immediate fast-wake predicate
/// (the caller is responsible for re-queuing itself through the normal
/// ready-queue path if it wants to run again).
pub fn co_yield_to_scheduler() {
    let data = WORKER_ENV.with(|env| {
        let ctx = env.scheduler_ctx.borrow_mut().take().expect("co_yield called outside a coroutine");
        env.running.set(None);
        ctx
    });
    let transfer = data.resume(0);
    WORKER_ENV.with(|env| {
        *env.scheduler_ctx.borrow_mut() = Some(transfer.context);
    });
}

/// Outcome of one `co_start` round-trip into a coroutine.
pub enum SwitchOutcome {
    /// The coroutine ran to completion (`Execute` returned).
    Completed,
    /// The coroutine parked itself on a synchronisation object; the
    /// worker must not touch the coroutine again until `co_wake`.
    Parked,
}

/// Switch the calling (scheduler) context into `entry` running on
/// `stack`, implementing the `co_start` inner loop: after the first
/// switch-out, consult the pending predicate and either hand ownership
/// to a waiter (`Parked`) or immediately switch back in on a fast wake,
/// looping until the coroutine either completes or genuinely parks.
///
/// `initial` is `true` on the coroutine's first ever resume (so the
/// entry trampoline knows to call `Context::new` vs. resuming a saved
/// context — the caller passes the already-correct `Context` either
/// way; this flag only affects logging/bookkeeping at the call site).
pub fn co_start(
    task: NonNull<TaskBase>,
    ctx: Context,
    _initial: bool,
) -> (Context, SwitchOutcome) {
    WORKER_ENV.with(|env| {
        env.running.set(Some(task));
    });

    let mut current = ctx;
    loop {
        let transfer: Transfer = current.resume(task.as_ptr() as usize);
        // The coroutine switched back out; its own paused context now
        // lives in `transfer.context` and will be consumed by the next
        // resume into it.
        let next_ctx = transfer.context;

        let pending = WORKER_ENV.with(|env| env.pending.borrow_mut().take());
        match pending {
            None => {
                WORKER_ENV.with(|env| env.running.set(None));
                return (next_ctx, SwitchOutcome::Completed);
            }
            Some(pred) => {
                if pred(task) {
                    WORKER_ENV.with(|env| env.running.set(None));
                    return (next_ctx, SwitchOutcome::Parked);
                }
                // Fast wake: the predicate already observed the
                // condition satisfied, re-enter immediately.
                current = next_ctx;
                continue;
            }
        }
    }
}

/// Record the scheduler-side context that a running coroutine should
/// resume into on its next yield. Called once, immediately before the
/// first `co_start` resume for a given worker iteration.
pub fn prime_scheduler_context(ctx: Context) {
    WORKER_ENV.with(|env| {
        *env.scheduler_ctx.borrow_mut() = Some(ctx);
    });
}
