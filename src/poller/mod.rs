//! epoll-based I/O poller.
//!
//! One [`Poller`] per QoS plus one global instance for blocking
//! `wait_fd` calls. Built directly on `libc`'s epoll/eventfd syscalls —
//! the Non-goals explicitly rule out pulling in a reactor crate since
//! this engine's concurrency model is bespoke stackful coroutines, not
//! `Future`-based tasks.

pub mod timer;

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{FlowrtError, FlowrtResult};
use timer::{TimerCallback, TimerMap};

/// `epoll_ctl` op for [`Poller::add_fd_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlOp {
    Add,
    Mod,
}

/// What to do when an event fires for a registered fd.
pub enum Registration {
    /// User-callback variant: invoked synchronously from the polling
    /// thread with the fired event mask.
    Callback(Arc<dyn Fn(u32) + Send + Sync>),
    /// Thread-mode task-wait variant: a condvar-backed wake slot a
    /// blocking consumer waits on directly.
    Waiter(Arc<FdWaitSlot>),
    /// Coroutine-mode task-wait variant: `key` is
    /// the waiting task's stable identity. Whether an event delivers
    /// immediately or gets cached depends on whether the consumer has
    /// already armed itself under `key` in [`Poller::wait_armed`] by the
    /// time the event arrives — see [`Poller::poll_once`].
    TaskWait { key: usize },
}

/// Condvar-based wake slot backing the task-wait registration variant.
#[derive(Default)]
pub struct FdWaitSlot {
    state: Mutex<Option<u32>>,
    cvar: std::sync::Condvar,
}

impl FdWaitSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wake(&self, events: u32) {
        let mut guard = self.state.lock().expect("fd wait slot poisoned");
        *guard = Some(events);
        self.cvar.notify_all();
    }

    /// Blocks (thread mode) until woken or cached events already
    /// arrived before the wait began.
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> Option<u32> {
        let guard = self.state.lock().expect("fd wait slot poisoned");
        let (mut guard, _timed_out) = match timeout {
            Some(t) => {
                let (g, r) = self.cvar.wait_timeout_while(guard, t, |v| v.is_none()).expect("fd wait slot poisoned");
                (g, r.timed_out())
            }
            None => (self.cvar.wait_while(guard, |v| v.is_none()).expect("fd wait slot poisoned"), false),
        };
        guard.take()
    }
}

/// One epoll instance plus its registration bookkeeping.
pub struct Poller {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    wake_data_map: Mutex<HashMap<RawFd, Vec<Registration>>>,
    del_cnt_map: Mutex<HashMap<RawFd, u32>>,
    cached_task_events: Mutex<HashMap<usize, Vec<u32>>>,
    /// Consumers currently parked under a [`Registration::TaskWait`] key.
    /// Absence of a key here is what sends an arriving event down the
    /// mask-and-cache path instead.
    wait_armed: Mutex<HashMap<usize, Arc<dyn Fn(u32) + Send + Sync>>>,
    polling: AtomicBool,
    timers: TimerMap,
}

unsafe impl Send for Poller {}
unsafe impl Sync for Poller {}

impl Poller {
    pub fn new() -> FlowrtResult<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(FlowrtError::resource_exhausted("epoll_create1 failed"));
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            unsafe { libc::close(epoll_fd) };
            return Err(FlowrtError::resource_exhausted("eventfd failed"));
        }
        let mut ev = libc::epoll_event { events: libc::EPOLLIN as u32, u64: wake_fd as u64 };
        let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if rc != 0 {
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(FlowrtError::resource_exhausted("epoll_ctl(ADD, wake_fd) failed"));
        }
        Ok(Self {
            epoll_fd,
            wake_fd,
            wake_data_map: Mutex::new(HashMap::new()),
            del_cnt_map: Mutex::new(HashMap::new()),
            cached_task_events: Mutex::new(HashMap::new()),
            wait_armed: Mutex::new(HashMap::new()),
            polling: AtomicBool::new(false),
            timers: TimerMap::new(),
        })
    }

    /// Breaks a blocking [`Poller::poll_once`] call via the self-wake eventfd.
    pub fn wake_up(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    /// `AddFdEvent(op, events, fd, registration)`.
    pub fn add_fd_event(&self, op: CtlOp, events: u32, fd: RawFd, registration: Registration) -> FlowrtResult<()> {
        let mut map = self.wake_data_map.lock().expect("wake_data_map poisoned");
        let ctl_op = match op {
            CtlOp::Add => {
                map.entry(fd).or_default().push(registration);
                libc::EPOLL_CTL_ADD
            }
            CtlOp::Mod => {
                let regs = map.get_mut(&fd).ok_or_else(|| FlowrtError::state_violation(format!("MOD on unregistered fd {fd}")))?;
                if regs.len() != 1 {
                    return Err(FlowrtError::state_violation(format!("MOD requires exactly one registration on fd {fd}")));
                }
                regs[0] = registration;
                libc::EPOLL_CTL_MOD
            }
        };
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, ctl_op, fd, &mut ev) };
        if rc != 0 {
            return Err(FlowrtError::resource_exhausted(format!("epoll_ctl failed for fd {fd}")));
        }
        Ok(())
    }

    /// `DelFdEvent(fd)`: issue `EPOLL_CTL_DEL` immediately; defer the
    /// actual `wake_data_map` entry removal to `release_fd_wake_data`
    /// so in-flight events for `fd` in the current `PollOnce` can still
    /// be looked up.
    pub fn del_fd_event(&self, fd: RawFd) -> FlowrtResult<()> {
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(FlowrtError::state_violation(format!("epoll_ctl(DEL) failed for fd {fd}")));
        }
        *self.del_cnt_map.lock().expect("del_cnt_map poisoned").entry(fd).or_insert(0) += 1;
        self.wake_up();
        Ok(())
    }

    fn release_fd_wake_data(&self) {
        let mut del_map = self.del_cnt_map.lock().expect("del_cnt_map poisoned");
        if del_map.is_empty() {
            return;
        }
        let mut wake_map = self.wake_data_map.lock().expect("wake_data_map poisoned");
        for (fd, _) in del_map.drain() {
            wake_map.remove(&fd);
        }
    }

    /// `PollOnce(timeout_ms)`.
    pub fn poll_once(&self, timeout_ms: i32) -> FlowrtResult<i32> {
        let now = crate::queue::now_us();
        let mut effective_timeout = timeout_ms;
        if let Some(deadline) = self.timers.next_deadline() {
            let timer_wait_ms = deadline.saturating_sub(now) / 1000;
            if deadline <= now {
                let fired = self.timers.run_due(now);
                if fired > 0 {
                    return Ok(RET_TIMER);
                }
            } else if timeout_ms < 0 || (timer_wait_ms as i32) < timeout_ms {
                effective_timeout = timer_wait_ms as i32;
            }
        }

        if !self.polling.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            return Err(FlowrtError::state_violation("PollOnce re-entered on the same poller"));
        }

        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let n = unsafe { libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, effective_timeout) };
        self.polling.store(false, Ordering::Release);

        if n < 0 {
            return Err(FlowrtError::resource_exhausted("epoll_wait failed"));
        }

        let mut delivered = 0;
        for ev in events.iter().take(n as usize) {
            let fd = ev.u64 as RawFd;
            if fd == self.wake_fd {
                let mut buf = [0u8; 8];
                unsafe { libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
                continue;
            }
            let mut map = self.wake_data_map.lock().expect("wake_data_map poisoned");
            if let Some(regs) = map.get(&fd) {
                for reg in regs {
                    match reg {
                        Registration::Callback(cb) => {
                            cb(ev.events);
                            delivered += 1;
                        }
                        Registration::Waiter(slot) => {
                            slot.wake(ev.events);
                            delivered += 1;
                        }
                        Registration::TaskWait { key } => {
                            let armed = self.wait_armed.lock().expect("wait_armed poisoned").remove(key);
                            match armed {
                                // Present: a consumer already parked under
                                // this key — hand the event straight to its
                                    // wake callback.
                                Some(wake) => {
                                    wake(ev.events);
                                    delivered += 1;
                                }
                                // Absent: the event beat the consumer to
                                // the wait call. Mask the fd so it doesn't
                                // keep firing, and stash the event for the
                                // consumer's next `WaitFdEvent` to pick up
                                // case.
                                None => {
                                    self.mask_fd(fd);
                                    self.cached_task_events
                                        .lock()
                                        .expect("cached_task_events poisoned")
                                        .entry(*key)
                                        .or_default()
                                        .push(ev.events);
                                    delivered += 1;
                                }
                            }
                        }
                    }
                }
            }
            drop(map);
        }

        self.release_fd_wake_data();
        if delivered > 0 {
            Ok(RET_EPOLL)
        } else {
            Ok(RET_NULL)
        }
    }

    pub fn register_timer(&self, deadline_us: u64, cb: TimerCallback, repeat: bool, interval_us: u64) -> u64 {
        let handle = self.timers.register(deadline_us, cb, repeat, interval_us);
        self.wake_up();
        handle
    }

    pub fn unregister_timer(&self, handle: u64) -> bool {
        self.timers.unregister(handle)
    }

    /// Cache an event that arrived before its consumer called
    /// the consumer's wait call. `waiter_key` is
    /// any stable identity the caller associates with the consumer
    /// (e.g. the task's `gid` as `usize`).
    pub fn cache_event(&self, waiter_key: usize, events: u32) {
        self.cached_task_events.lock().expect("cached_task_events poisoned").entry(waiter_key).or_default().push(events);
    }

    pub fn take_cached_events(&self, waiter_key: usize) -> Option<Vec<u32>> {
        self.cached_task_events.lock().expect("cached_task_events poisoned").remove(&waiter_key)
    }

    /// Mark `key` as actively parked, with `wake` as the action
    /// `poll_once` should run on its behalf when the next matching event
    /// arrives. Must be called only
    /// after the matching `TaskWait` registration is already in place,
    /// and only once the consumer has genuinely committed to waiting
    /// (right before yielding, not before).
    pub fn arm_waiter(&self, key: usize, wake: Arc<dyn Fn(u32) + Send + Sync>) {
        self.wait_armed.lock().expect("wait_armed poisoned").insert(key, wake);
    }

    /// `EPOLL_CTL_MOD` with an empty interest set: stop delivering
    /// further events for `fd` until [`Poller::unmask_fd`] restores
    /// interest.
    fn mask_fd(&self, fd: RawFd) {
        let mut ev = libc::epoll_event { events: 0, u64: fd as u64 };
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev);
        }
    }

    /// Restore `fd`'s interest set after a consumer picks up its cached
    /// events from the cache.
    pub fn unmask_fd(&self, fd: RawFd, events: u32) -> FlowrtResult<()> {
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if rc != 0 {
            return Err(FlowrtError::state_violation(format!("epoll_ctl(MOD) unmask failed for fd {fd}")));
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

pub const RET_NULL: i32 = 0;
pub const RET_EPOLL: i32 = 1;
pub const RET_TIMER: i32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_once_wakes_on_self_pipe() {
        let poller = Poller::new().expect("create poller");
        poller.wake_up();
        let result = poller.poll_once(1000).expect("poll_once");
        assert_eq!(result, RET_NULL);
    }

    #[test]
    fn mod_without_prior_add_fails() {
        let poller = Poller::new().expect("create poller");
        let result = poller.add_fd_event(CtlOp::Mod, libc::EPOLLIN as u32, 999, Registration::Callback(Arc::new(|_| {})));
        assert!(result.is_err());
    }

    #[test]
    fn timer_due_now_reports_timer_result() {
        let poller = Poller::new().expect("create poller");
        poller.register_timer(0, Box::new(|| {}), false, 0);
        let result = poller.poll_once(0).expect("poll_once");
        assert_eq!(result, RET_TIMER);
    }
}
