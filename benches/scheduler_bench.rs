//! Scheduler and runtime throughput benchmarks.
//!
//! Covers the hot, perf-sensitive paths: global FIFO insert/pop,
//! local-deque-with-stealing pickup under a skewed burst, and
//! end-to-end `Runtime::submit` latency per QoS.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::time::Duration;

use flowrt::qos::QoS;
use flowrt::queue::TaskAttr;
use flowrt::sched::{Scheduler, WorkerTicker};
use flowrt::task::{NormalTask, Task};
use flowrt::{Runtime, RuntimeConfig};

fn dummy_task() -> Task {
    Task::Normal(NormalTask::spawn(QoS::Default, None, None, Box::new(|| {})))
}

fn benchmark_global_fifo_insert(c: &mut Criterion) {
    c.bench_function("scheduler_insert_global", |b| {
        let sched = Scheduler::new();
        b.iter(|| {
            sched.insert(QoS::Default, black_box(dummy_task()));
        })
    });
}

fn benchmark_global_fifo_insert_then_pop(c: &mut Criterion) {
    c.bench_function("scheduler_insert_then_pickup", |b| {
        let sched = Scheduler::new();
        let local = sched.register_worker(QoS::Default);
        let mut ticker = WorkerTicker::new(1000);
        b.iter(|| {
            sched.insert(QoS::Default, dummy_task());
            black_box(sched.try_pickup(QoS::Default, &local, &mut ticker));
        })
    });
}

fn benchmark_steal_balanced_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_steal_burst");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("drain_100_from_one_local_across_4_workers", |b| {
        b.iter_batched(
            || {
                let sched = Scheduler::new();
                let locals: Vec<_> = (0..4).map(|_| sched.register_worker(QoS::Default)).collect();
                for _ in 0..100 {
                    locals[0].push(dummy_task());
                }
                (sched, locals)
            },
            |(sched, locals)| {
                let mut tickers: Vec<_> = (0..locals.len()).map(|_| WorkerTicker::new(1000)).collect();
                let mut drained = 0usize;
                let mut misses = 0usize;
                while drained < 100 && misses < locals.len() * 2 {
                    let mut picked_any = false;
                    for (i, local) in locals.iter().enumerate() {
                        if sched.try_pickup(QoS::Default, local, &mut tickers[i]).is_some() {
                            drained += 1;
                            picked_any = true;
                        }
                    }
                    misses = if picked_any { 0 } else { misses + 1 };
                }
                black_box(drained)
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn benchmark_runtime_submit_per_qos(c: &mut Criterion) {
    let mut group = c.benchmark_group("runtime_submit");

    for qos in [QoS::Background, QoS::Default, QoS::UserInteractive] {
        group.bench_function(format!("submit_{qos:?}"), |b| {
            let rt = Runtime::new(RuntimeConfig::default());
            b.iter(|| {
                rt.submit(Box::new(|| {}), TaskAttr { qos_raw: qos as i32, ..Default::default() })
                    .expect("submit")
            })
        });
    }

    group.finish();
}

criterion_group!(
    scheduler_benches,
    benchmark_global_fifo_insert,
    benchmark_global_fifo_insert_then_pop,
    benchmark_steal_balanced_burst,
    benchmark_runtime_submit_per_qos,
);

criterion_main!(scheduler_benches);
