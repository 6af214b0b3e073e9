//! `wait_fd` wakes promptly once an event fires ("wait-then-event"),
//! and an event that arrives before the consumer parks is served from
//! the cache instead of being missed ("event-then-wait").

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use flowrt::poller::{CtlOp, FdWaitSlot, Poller, Registration};

fn make_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe() failed");
    (fds[0], fds[1])
}

#[test]
fn wait_then_event_wakes_within_a_hundred_millis() {
    let poller = Arc::new(Poller::new().expect("create poller"));
    let (read_fd, write_fd) = make_pipe();

    let slot = FdWaitSlot::new();
    poller.add_fd_event(CtlOp::Add, libc::EPOLLIN as u32, read_fd, Registration::Waiter(Arc::clone(&slot))).expect("register");

    let bg_poller = Arc::clone(&poller);
    let handle = std::thread::spawn(move || bg_poller.poll_once(200));

    unsafe {
        libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
    }

    let events = slot.wait_blocking(Some(Duration::from_millis(100)));
    assert!(events.is_some(), "task must be woken within 100ms of the fd becoming readable");
    assert_eq!(handle.join().unwrap().expect("poll_once"), flowrt::poller::RET_EPOLL);

    poller.del_fd_event(read_fd).expect("unregister");
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

#[test]
fn event_then_wait_is_served_from_the_cache() {
    let poller = Poller::new().expect("create poller");
    let (read_fd, write_fd) = make_pipe();

    // Register the fd under the coroutine-mode `TaskWait` variant, the
    // same registration a real `wait_fd` caller installs, but never
    // `arm_waiter` it — modeling a consumer that hasn't called
    // `wait_fd` yet.
    let waiter_key = read_fd as usize;
    poller.add_fd_event(CtlOp::Add, libc::EPOLLIN as u32, read_fd, Registration::TaskWait { key: waiter_key }).expect("register");

    unsafe {
        libc::write(write_fd, b"y".as_ptr() as *const libc::c_void, 1);
    }
    std::thread::sleep(Duration::from_millis(1));

    // `poll_once` itself must discover there is no armed waiter, mask
    // the fd, and stash the event — not the test reaching around it.
    assert_eq!(poller.poll_once(50).expect("poll_once"), flowrt::poller::RET_EPOLL);

    let cached = poller.take_cached_events(waiter_key);
    assert_eq!(cached, Some(vec![libc::EPOLLIN as u32]), "a consumer calling WaitFdEvent after the fact must see the cached event immediately");
    assert!(poller.take_cached_events(waiter_key).is_none(), "cached events are consumed exactly once");

    // The fd was masked (events=0) by the absent-consumer path; writing
    // again and polling must not redeliver until the consumer unmasks.
    unsafe {
        libc::write(write_fd, b"z".as_ptr() as *const libc::c_void, 1);
    }
    std::thread::sleep(Duration::from_millis(1));
    assert_eq!(poller.poll_once(50).expect("poll_once"), flowrt::poller::RET_NULL, "masked fd must not redeliver before unmask_fd");

    poller.unmask_fd(read_fd, libc::EPOLLIN as u32).expect("unmask");
    std::thread::sleep(Duration::from_millis(1));
    assert_eq!(poller.poll_once(50).expect("poll_once"), flowrt::poller::RET_EPOLL, "unmasked fd must redeliver the still-pending byte");

    poller.del_fd_event(read_fd).expect("unregister");
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

#[test]
fn event_with_an_armed_waiter_delivers_immediately() {
    let poller = Arc::new(Poller::new().expect("create poller"));
    let (read_fd, write_fd) = make_pipe();

    let waiter_key = read_fd as usize;
    poller.add_fd_event(CtlOp::Add, libc::EPOLLIN as u32, read_fd, Registration::TaskWait { key: waiter_key }).expect("register");

    let woken = Arc::new(std::sync::Mutex::new(None));
    let woken_clone = Arc::clone(&woken);
    poller.arm_waiter(waiter_key, Arc::new(move |events| {
        *woken_clone.lock().unwrap() = Some(events);
    }));

    unsafe {
        libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
    }
    std::thread::sleep(Duration::from_millis(1));

    assert_eq!(poller.poll_once(50).expect("poll_once"), flowrt::poller::RET_EPOLL);
    assert_eq!(*woken.lock().unwrap(), Some(libc::EPOLLIN as u32), "an armed waiter's wake callback must run instead of caching");
    assert!(poller.take_cached_events(waiter_key).is_none(), "armed delivery must not also populate the cache");

    poller.del_fd_event(read_fd).expect("unregister");
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}
