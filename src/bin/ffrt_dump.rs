//! ffrt-dump - inspection CLI for a running flowrt demo workload.
//!
//! Builds a small runtime, submits a handful of demo tasks across a
//! serial queue and the global scheduler, then prints the requested
//! `ffrt_dump` snapshot. A `clap::Parser` CLI with `env_logger::init()`
//! first in `main`.

use std::process;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use flowrt::dump::DumpKind;
use flowrt::queue::{QueueAttr, QueueType, TaskAttr};
use flowrt::{QoS, Runtime, RuntimeConfig};

#[derive(Parser)]
#[command(name = "ffrt-dump")]
#[command(about = "Inspect a demo flowrt runtime's workers, queues and tasks")]
#[command(version)]
struct Cli {
    /// What kind of snapshot to print.
    #[arg(long, value_enum, default_value = "info-all")]
    kind: DumpKindArg,

    /// Number of demo tasks to submit to the serial queue before dumping.
    #[arg(long, default_value_t = 4)]
    tasks: usize,

    /// Milliseconds to wait after submission before dumping, so some
    /// tasks have had a chance to run.
    #[arg(long, default_value_t = 50)]
    settle_ms: u64,

    /// Size of the dump buffer in bytes.
    #[arg(long, default_value_t = 8192)]
    buf_size: usize,
}

#[derive(Clone, ValueEnum)]
enum DumpKindArg {
    InfoAll,
    TaskStatisticInfo,
}

impl From<DumpKindArg> for DumpKind {
    fn from(v: DumpKindArg) -> Self {
        match v {
            DumpKindArg::InfoAll => DumpKind::InfoAll,
            DumpKindArg::TaskStatisticInfo => DumpKind::TaskStatisticInfo,
        }
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let rt = Runtime::new(RuntimeConfig::from_env_and_file());

    let queue_id = match rt.queue_create(QueueType::Serial, Some("ffrt-dump-demo"), QueueAttr { qos: QoS::Default, ..Default::default() }) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("failed to create demo queue: {e}");
            process::exit(1);
        }
    };

    for i in 0..cli.tasks {
        let attr = TaskAttr { label: Some(format!("demo-task-{i}")), ..Default::default() };
        if let Err(e) = rt.queue_submit(queue_id, Box::new(move || { log::info!("demo task {i} running"); }), attr) {
            eprintln!("failed to submit demo task {i}: {e}");
        }
    }

    std::thread::sleep(Duration::from_millis(cli.settle_ms));

    let mut buf = vec![0u8; cli.buf_size];
    let n = rt.dump(cli.kind.into(), &mut buf);
    if n < 0 {
        eprintln!("dump failed: buffer too small (tried {} bytes)", cli.buf_size);
        rt.shutdown(Duration::from_secs(1));
        process::exit(1);
    }
    let text = String::from_utf8_lossy(&buf[..n as usize]);
    println!("{text}");

    rt.shutdown(Duration::from_secs(1));
}
