//! The eventhandler_adapter queue drains
//! strictly by priority (`vip > immediate > high > low > idle`)
//! regardless of submission order.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flowrt::queue::{QueueAttr, QueueType, TaskAttr};
use flowrt::task::AdapterPriority;
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
fn adapter_drains_vip_before_high_before_low() {
    let rt = Runtime::new(RuntimeConfig::default());
    let id = rt.queue_create(QueueType::EventHandlerAdapter, None, QueueAttr::default()).expect("create queue");

    // Hold the single-worker gate so low/vip/high all land in their
    // lanes before the adapter's first dispatch batch is popped.
    let gate = Arc::new(Mutex::new(()));
    let guard = gate.lock().unwrap();
    let held = Arc::clone(&gate);
    rt.queue_submit(
        id,
        Box::new(move || {
            let _ = held.lock().unwrap();
        }),
        TaskAttr { priority: Some(AdapterPriority::Vip), ..Default::default() },
    )
    .expect("submit gate-holder");

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    for (name, priority) in [("low", AdapterPriority::Low), ("vip", AdapterPriority::Vip), ("high", AdapterPriority::High)] {
        let o = Arc::clone(&order);
        rt.queue_submit(id, Box::new(move || o.lock().unwrap().push(name)), TaskAttr { priority: Some(priority), ..Default::default() })
            .expect("submit");
    }

    drop(guard);
    assert!(wait_until(|| order.lock().unwrap().len() == 3, Duration::from_secs(2)));
    assert_eq!(*order.lock().unwrap(), vec!["vip", "high", "low"]);

    rt.shutdown(Duration::from_secs(1));
}

#[test]
fn idle_lane_only_runs_once_other_lanes_are_empty() {
    let rt = Runtime::new(RuntimeConfig::default());
    let id = rt.queue_create(QueueType::EventHandlerAdapter, None, QueueAttr::default()).expect("create queue");

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let o = Arc::clone(&order);
    rt.queue_submit(id, Box::new(move || o.lock().unwrap().push("idle")), TaskAttr { priority: Some(AdapterPriority::Idle), ..Default::default() })
        .expect("submit idle");
    let o = Arc::clone(&order);
    rt.queue_submit(id, Box::new(move || o.lock().unwrap().push("low")), TaskAttr { priority: Some(AdapterPriority::Low), ..Default::default() })
        .expect("submit low");

    assert!(wait_until(|| order.lock().unwrap().len() == 2, Duration::from_secs(2)));
    assert_eq!(*order.lock().unwrap(), vec!["low", "idle"]);

    rt.shutdown(Duration::from_secs(1));
}
