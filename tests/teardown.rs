//! At shutdown, every worker across every
//! QoS group exits within the caller's join timeout, even with
//! in-flight queues and submissions outstanding.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flowrt::qos::QoS;
use flowrt::queue::{QueueAttr, QueueType, TaskAttr};
use flowrt::{Runtime, RuntimeConfig};

#[test]
fn shutdown_joins_every_worker_within_one_second() {
    let rt = Runtime::new(RuntimeConfig::default());

    let ran = Arc::new(AtomicUsize::new(0));
    for qos in [QoS::Background, QoS::Default, QoS::UserInteractive] {
        let r = Arc::clone(&ran);
        rt.submit(Box::new(move || { r.fetch_add(1, Ordering::SeqCst); }), TaskAttr { qos_raw: qos as i32, ..Default::default() })
            .expect("submit");
    }

    let id = rt.queue_create(QueueType::Concurrent, None, QueueAttr { max_concurrency: 4, ..Default::default() }).expect("create queue");
    for _ in 0..10 {
        rt.queue_submit(id, Box::new(|| std::thread::sleep(Duration::from_millis(5))), TaskAttr::default()).expect("submit");
    }

    std::thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    rt.shutdown(Duration::from_secs(1));
    assert!(start.elapsed() <= Duration::from_secs(2), "shutdown must complete within its join timeout plus slack");
}

#[test]
fn shutdown_is_safe_with_no_workers_ever_spawned() {
    let rt = Runtime::new(RuntimeConfig::default());
    rt.shutdown(Duration::from_secs(1));
}
