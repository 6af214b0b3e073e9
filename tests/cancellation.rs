//! A task cancelled by name before its delay
//! elapses never executes, and cancellation of an unknown/finished
//! target reports failure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowrt::queue::{QueueAttr, QueueType, TaskAttr};
use flowrt::{Runtime, RuntimeConfig};

#[test]
fn cancel_by_name_prevents_execution() {
    let rt = Runtime::new(RuntimeConfig::default());
    let id = rt.queue_create(QueueType::Serial, None, QueueAttr::default()).expect("create queue");

    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);
    rt.queue_submit(
        id,
        Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }),
        TaskAttr { delay_us: 100_000, label: Some("task-A".into()), ..Default::default() },
    )
    .expect("submit A");

    assert!(rt.queue_cancel_by_name(id, "task-A").expect("pattern compiles"));

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(ran.load(Ordering::SeqCst), 0, "cancelled task must never run");

    // Idempotent: nothing left to match the second time around.
    assert!(!rt.queue_cancel_by_name(id, "task-A").expect("pattern compiles"));

    rt.shutdown(Duration::from_secs(1));
}

#[test]
fn targeted_cancel_fails_once_task_has_been_dispatched() {
    let rt = Runtime::new(RuntimeConfig::default());
    let id = rt.queue_create(QueueType::Serial, None, QueueAttr::default()).expect("create queue");

    let handle = rt.queue_submit_h(id, Box::new(|| {}), TaskAttr::default()).expect("submit");
    // Give it every chance to dispatch immediately (delay=0, no gate).
    std::thread::sleep(Duration::from_millis(100));
    assert!(!rt.queue_cancel(handle), "an already-dispatched task cannot be cancelled");

    rt.shutdown(Duration::from_secs(1));
}

#[test]
fn cancel_all_is_idempotent() {
    let rt = Runtime::new(RuntimeConfig::default());
    let id = rt.queue_create(QueueType::Serial, None, QueueAttr::default()).expect("create queue");
    rt.queue_submit(id, Box::new(|| {}), TaskAttr { delay_us: 1_000_000, ..Default::default() }).expect("submit");

    assert!(rt.queue_cancel_all(id));
    assert!(rt.queue_cancel_all(id), "a second cancel_all on an already-empty queue is a no-op success");

    rt.shutdown(Duration::from_secs(1));
}

#[test]
fn unknown_queue_cancel_by_name_reports_failure() {
    let rt = Runtime::new(RuntimeConfig::default());
    assert!(!rt.queue_cancel_by_name(123456, "anything").expect("pattern compiles"));
    rt.shutdown(Duration::from_secs(1));
}
