//! Loop API: lets a concurrent-style queue be driven by a dedicated
//! epoll reactor on a caller-owned thread instead of being dispatched
//! straight back onto the scheduler.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{FlowrtError, FlowrtResult};
use crate::poller::timer::TimerCallback;
use crate::poller::{CtlOp, Poller, Registration};
use crate::queue::eventhandler::EventHandlerInteractive;
use crate::queue::{concurrent::ConcurrentQueue, now_us, LoopSink};

/// The two queue variants that support `set_loop`: only the
/// concurrent core and the eventhandler-interactive wrapper around it
/// integrate with a loop; serial and the adapter always dispatch
/// through the scheduler.
#[derive(Clone)]
pub enum LoopableQueue {
    Concurrent(Arc<ConcurrentQueue>),
    EventHandlerInteractive(Arc<EventHandlerInteractive>),
}

impl LoopableQueue {
    fn queue_id(&self) -> u32 {
        match self {
            LoopableQueue::Concurrent(q) => q.queue_id(),
            LoopableQueue::EventHandlerInteractive(q) => q.queue_id(),
        }
    }

    fn set_loop(&self, sink: Option<Arc<dyn LoopSink>>) {
        match self {
            LoopableQueue::Concurrent(q) => q.set_loop(sink),
            LoopableQueue::EventHandlerInteractive(q) => q.set_loop(sink),
        }
    }

    fn pull_and_dispatch(&self) {
        match self {
            LoopableQueue::Concurrent(q) => q.pull_and_dispatch(),
            LoopableQueue::EventHandlerInteractive(q) => q.pull_and_dispatch(),
        }
    }
}

/// `ffrt_loop_t`: one dedicated epoll reactor bound to one queue.
pub struct Loop {
    queue: LoopableQueue,
    poller: Poller,
    running: AtomicBool,
    pending_dispatch: AtomicBool,
}

impl Loop {
    /// `ffrt_loop_create(queue)`: binds a fresh reactor to `queue`,
    /// wiring it in as the queue's [`LoopSink`] so future `Deliver`
    /// calls route here instead of spawning a scheduler placeholder.
    pub fn create(queue: LoopableQueue) -> FlowrtResult<Arc<Self>> {
        let poller = Poller::new()?;
        let this = Arc::new(Self {
            queue,
            poller,
            running: AtomicBool::new(false),
            pending_dispatch: AtomicBool::new(false),
        });
        this.queue.set_loop(Some(Arc::clone(&this) as Arc<dyn LoopSink>));
        Ok(this)
    }

    /// `ffrt_loop_destroy(loop)`: detaches from the queue (future
    /// `Deliver` calls fall back to the scheduler placeholder) and
    /// stops the reactor if it was running.
    pub fn destroy(&self) {
        self.stop();
        self.queue.set_loop(None);
    }

    /// `ffrt_loop_run(loop)`: blocks the calling thread, alternately
    /// polling fd/timer events and draining any queue delivery that
    /// arrived while blocked, until [`Loop::stop`] is called.
    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poller.poll_once(-1) {
                log::warn!("loop for queue {} poll_once failed: {e}", self.queue.queue_id());
            }
            if self.pending_dispatch.swap(false, Ordering::AcqRel) {
                self.queue.pull_and_dispatch();
            }
        }
    }

    /// `ffrt_loop_stop(loop)`: unblocks a concurrent `run` call.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.poller.wake_up();
    }

    /// `ffrt_loop_epoll_ctl(loop, op, fd, events, cb)`.
    pub fn epoll_ctl(&self, op: CtlOp, fd: RawFd, events: u32, cb: Arc<dyn Fn(u32) + Send + Sync>) -> FlowrtResult<()> {
        self.poller.add_fd_event(op, events, fd, Registration::Callback(cb))
    }

    /// `ffrt_loop_epoll_del(loop, fd)`: counterpart the header groups
    /// under the same ctl family.
    pub fn epoll_del(&self, fd: RawFd) -> FlowrtResult<()> {
        self.poller.del_fd_event(fd)
    }

    /// `ffrt_loop_timer_start(loop, timeout_us, cb, repeat)`: returns
    /// an opaque handle usable with [`Loop::timer_stop`].
    pub fn timer_start(&self, timeout_us: u64, cb: TimerCallback, repeat: bool) -> u64 {
        let deadline = now_us() + timeout_us;
        self.poller.register_timer(deadline, cb, repeat, timeout_us)
    }

    /// `ffrt_loop_timer_stop(loop, handle)`.
    pub fn timer_stop(&self, handle: u64) -> bool {
        self.poller.unregister_timer(handle)
    }
}

impl LoopSink for Loop {
    fn deliver(&self, queue_id: u32) {
        if queue_id != self.queue.queue_id() {
            return;
        }
        self.pending_dispatch.store(true, Ordering::Release);
        self.poller.wake_up();
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.queue.set_loop(None);
    }
}

/// `ffrt_loop_create` surfacing an explicit status rather than a
/// `FlowrtResult`, for the C-boundary translation used by
/// `runtime.rs`.
pub fn create(queue: LoopableQueue) -> Result<Arc<Loop>, FlowrtError> {
    Loop::create(queue)
}
