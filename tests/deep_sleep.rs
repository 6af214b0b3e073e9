//! A worker that stays idle past the light
//! sleep timeout either retires (idle-destroy on) or releases its
//! stack and enters an untimed deep sleep (idle-destroy off), waking on
//! the next wakeup signal either way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowrt::config::RuntimeConfig;
use flowrt::monitor::{IdleAction, QosMonitor};
use flowrt::qos::QoS;

#[test]
fn idle_destruct_off_releases_stack_then_waits_for_a_wakeup() {
    let cfg = RuntimeConfig::default();
    let monitor = Arc::new(QosMonitor::new(&cfg));
    let group = Arc::clone(&monitor);
    let released = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&released);

    let waker = Arc::clone(&monitor);
    let waker_thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        waker.group(QoS::Default).wake_one_sleeper();
    });

    let action = group.group(QoS::Default).idle_sleep(Duration::from_millis(20), false, move || {
        r.store(true, Ordering::SeqCst);
    });

    waker_thread.join().unwrap();
    assert_eq!(action, IdleAction::Retry);
    assert!(released.load(Ordering::SeqCst), "stack-release callback must run before the untimed deep sleep");
}

#[test]
fn idle_destruct_on_retires_instead_of_deep_sleeping() {
    let cfg = RuntimeConfig::default();
    let monitor = QosMonitor::new(&cfg);
    let action = monitor.group(QoS::Default).idle_sleep(Duration::from_millis(10), true, || {});
    assert_eq!(action, IdleAction::Retire);
}

#[test]
fn a_notification_during_light_sleep_short_circuits_to_retry() {
    let cfg = RuntimeConfig::default();
    let monitor = Arc::new(QosMonitor::new(&cfg));
    let waker = Arc::clone(&monitor);
    let waker_thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(5));
        waker.group(QoS::Default).wake_one_sleeper();
    });
    let action = monitor.group(QoS::Default).idle_sleep(Duration::from_secs(10), false, || {
        panic!("stack must not be released on a light-sleep wakeup");
    });
    waker_thread.join().unwrap();
    assert_eq!(action, IdleAction::Retry);
}
