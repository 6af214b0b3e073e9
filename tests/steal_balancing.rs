//! With several workers in one QoS group and a
//! burst landing on a single worker's local FIFO, every worker in the
//! group ends up executing a fair share via steal-balancing.

use flowrt::qos::QoS;
use flowrt::sched::{Scheduler, WorkerTicker};
use flowrt::task::{NormalTask, Task};

fn dummy_task() -> Task {
    Task::Normal(NormalTask::spawn(QoS::Default, None, None, Box::new(|| {})))
}

#[test]
fn every_worker_gets_at_least_ten_of_a_hundred_task_burst() {
    const WORKERS: usize = 4;
    const BURST: usize = 100;

    let scheduler = Scheduler::new();
    let locals: Vec<_> = (0..WORKERS).map(|_| scheduler.register_worker(QoS::Default)).collect();

    for _ in 0..BURST {
        locals[0].push(dummy_task());
    }

    let mut counts = vec![0usize; WORKERS];
    let mut tickers: Vec<_> = (0..WORKERS).map(|_| WorkerTicker::new(1000)).collect();

    let mut remaining = BURST;
    let mut consecutive_misses = 0;
    while remaining > 0 && consecutive_misses < WORKERS * 2 {
        let mut picked_any = false;
        for (i, local) in locals.iter().enumerate() {
            if let Some(_task) = scheduler.try_pickup(QoS::Default, local, &mut tickers[i]) {
                counts[i] += 1;
                remaining -= 1;
                picked_any = true;
            }
        }
        consecutive_misses = if picked_any { 0 } else { consecutive_misses + 1 };
    }

    assert_eq!(remaining, 0, "every queued task must eventually be picked up");
    for (i, c) in counts.iter().enumerate() {
        assert!(*c >= 10, "worker {i} only executed {c} of the {BURST}-task burst");
    }
}
