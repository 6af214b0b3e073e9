//! Serial queue delivers same-timestamp tasks
//! in submission order, and a delayed task only executes once its
//! delay has elapsed.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flowrt::queue::{now_us, QueueAttr, QueueType, TaskAttr};
use flowrt::{Runtime, RuntimeConfig};

fn wait_until(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    pred()
}

#[test]
fn serial_queue_runs_in_submission_order_and_honors_delay() {
    let rt = Runtime::new(RuntimeConfig::default());
    let id = rt.queue_create(QueueType::Serial, Some("order-test"), QueueAttr::default()).expect("create queue");

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let c_submit_time = now_us();
    let c_executed_at: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));

    let o = Arc::clone(&order);
    rt.queue_submit(id, Box::new(move || o.lock().unwrap().push("A")), TaskAttr::default()).expect("submit A");
    let o = Arc::clone(&order);
    rt.queue_submit(id, Box::new(move || o.lock().unwrap().push("B")), TaskAttr::default()).expect("submit B");

    let o = Arc::clone(&order);
    let c_at = Arc::clone(&c_executed_at);
    rt.queue_submit(
        id,
        Box::new(move || {
            o.lock().unwrap().push("C");
            *c_at.lock().unwrap() = Some(now_us());
        }),
        TaskAttr { delay_us: 10_000, ..Default::default() },
    )
    .expect("submit C");

    assert!(wait_until(|| order.lock().unwrap().len() == 3, Duration::from_secs(2)));
    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);

    let c_time = c_executed_at.lock().unwrap().expect("C recorded its own execution time");
    assert!(c_time.saturating_sub(c_submit_time) >= 10_000, "C must not run before its 10ms delay elapses");

    rt.shutdown(Duration::from_secs(1));
}

#[test]
fn submit_head_prepends_within_the_same_deadline_group() {
    let rt = Runtime::new(RuntimeConfig::default());
    let id = rt.queue_create(QueueType::Serial, None, QueueAttr::default()).expect("create queue");

    // Hold the queue's single in-flight slot with a slow task so both A
    // and B land in when_map before either is dispatched, which is what
    // makes "submit_head inserts ahead of A" observable.
    let gate = Arc::new(Mutex::new(()));
    let held = Arc::clone(&gate);
    let lock_guard = gate.lock().unwrap();
    rt.queue_submit(
        id,
        Box::new(move || {
            let _ = held.lock().unwrap();
        }),
        TaskAttr::default(),
    )
    .expect("submit gate-holder");

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let o = Arc::clone(&order);
    rt.queue_submit(id, Box::new(move || o.lock().unwrap().push("A")), TaskAttr::default()).expect("submit A");
    let o = Arc::clone(&order);
    rt.queue_submit_head(id, Box::new(move || o.lock().unwrap().push("B")), TaskAttr::default()).expect("submit B head");

    drop(lock_guard);
    assert!(wait_until(|| order.lock().unwrap().len() == 2, Duration::from_secs(2)));
    assert_eq!(*order.lock().unwrap(), vec!["B", "A"]);

    rt.shutdown(Duration::from_secs(1));
}
