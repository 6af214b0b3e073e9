//! Runtime configuration and settings.
//!
//! Env + config-file precedence, layered over a `serde`/`toml`
//! round-trippable struct so deployments can pin a config file without
//! recompiling.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::qos::{PerQos, QOS_LEVELS};

/// Per-QoS worker hard limit, matching `QOS_WORKER_MAXNUM` in the
/// original (a generous ceiling, not a tuned default).
pub const QOS_WORKER_MAXNUM: usize = 64;

/// Default per-queue/task watchdog and queue-monitor scan threshold.
pub const DEFAULT_TASK_TIMEOUT_US: u64 = 30_000_000;

/// Which notification strategy the QoS monitor uses. A config value
/// rather than derived from the process name, since cross-process name
/// sniffing doesn't fit a portable library embedded as a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyStrategy {
    Default,
    Conservative,
    UltraConservative,
}

impl Default for NotifyStrategy {
    fn default() -> Self {
        NotifyStrategy::Default
    }
}

/// Staged worker-escape delay configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EscapeStages {
    /// Worker-count threshold entering stage 2.
    pub stage1_workers: usize,
    /// Worker-count threshold entering stage 3.
    pub stage2_workers: usize,
    #[serde(with = "duration_ms")]
    pub stage1_interval: Duration,
    #[serde(with = "duration_ms")]
    pub stage2_interval: Duration,
    #[serde(with = "duration_ms")]
    pub stage3_interval: Duration,
}

impl Default for EscapeStages {
    fn default() -> Self {
        Self {
            stage1_workers: 4,
            stage2_workers: 8,
            stage1_interval: Duration::from_millis(10),
            stage2_interval: Duration::from_millis(100),
            stage3_interval: Duration::from_millis(1000),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Process-wide runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Default worker count per QoS (0 = auto-detect from `num_cpus`).
    pub cpu_worker_num: [usize; QOS_LEVELS],
    /// Hard worker-count ceiling per QoS.
    pub hard_limit: [usize; QOS_LEVELS],
    /// Global watchdog threshold, gates both the queue monitor and
    /// per-task timeout watchdogs.
    #[serde(with = "duration_us")]
    pub task_timeout_threshold: Duration,
    /// Free a deep-sleeping worker's coroutine stack when idle past the
    /// light-sleep timer.
    pub idle_worker_destruct: bool,
    /// Mark the page closest to a stack's high address read-only after
    /// allocation.
    pub strong_stack_protect: bool,
    /// Opt into worker-escape recovery.
    pub escape_enable: bool,
    pub escape_stages: EscapeStages,
    /// QoS monitor notification policy.
    pub notify_strategy: NotifyStrategy,
    /// Default coroutine stack size in bytes.
    pub default_stack_size: usize,
    /// Number of pre-reserved stacks the slab allocator pools per QoS.
    pub stack_pool_size: usize,
    /// Timeout a worker blocks on before falling back from light sleep
    /// (polling with a bound) to deep sleep (parking indefinitely).
    /// Overridden by [`RuntimeConfig::light_sleep_timeout`] to a shorter
    /// value when `idle_worker_destruct` is enabled, since destructing
    /// idle workers wants tighter feedback.
    #[serde(with = "duration_ms")]
    pub light_sleep_timeout_base: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let workers = (num_cpus::get()).max(1);
        Self {
            cpu_worker_num: [workers; QOS_LEVELS],
            hard_limit: [QOS_WORKER_MAXNUM; QOS_LEVELS],
            task_timeout_threshold: Duration::from_micros(DEFAULT_TASK_TIMEOUT_US),
            idle_worker_destruct: false,
            strong_stack_protect: false,
            escape_enable: false,
            escape_stages: EscapeStages::default(),
            notify_strategy: NotifyStrategy::default(),
            default_stack_size: 128 * 1024,
            stack_pool_size: 128,
            light_sleep_timeout_base: Duration::from_secs(10),
        }
    }
}

mod duration_us {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_micros() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}

impl RuntimeConfig {
    /// Build per-QoS worker counts as a [`PerQos`] table for consumers
    /// that want the typed accessor rather than a raw array.
    pub fn cpu_worker_num_table(&self) -> PerQos<usize> {
        PerQos::new(self.cpu_worker_num)
    }

    pub fn hard_limit_table(&self) -> PerQos<usize> {
        PerQos::new(self.hard_limit)
    }

    /// Effective light-sleep timeout: 5s when `idle_worker_destruct` is
    /// on (faster feedback for retiring idle workers), else
    /// `light_sleep_timeout_base`.
    pub fn light_sleep_timeout(&self) -> Duration {
        if self.idle_worker_destruct {
            Duration::from_secs(5)
        } else {
            self.light_sleep_timeout_base
        }
    }

    /// Load configuration: start from [`RuntimeConfig::default`], layer
    /// a TOML config file if the well-known path exists and the running
    /// process name matches an entry in it, then layer environment
    /// variables on top.
    pub fn from_env_and_file() -> Self {
        let mut cfg = Self::default();
        if let Some(path) = Self::well_known_config_path() {
            if Self::process_name_enabled(&path) {
                if let Ok(text) = std::fs::read_to_string(&path) {
                    if let Ok(file_cfg) = toml::from_str::<RuntimeConfig>(&text) {
                        cfg = file_cfg;
                    }
                }
            }
        }
        cfg.apply_env();
        cfg
    }

    fn well_known_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("flowrt").join("ffrt.toml"))
    }

    /// Newline-separated list of process-name substrings; matching
    /// processes enable the file-based config.
    fn process_name_enabled(path: &PathBuf) -> bool {
        let names_path = path.with_file_name("enabled_processes.txt");
        let exe_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_default();
        match std::fs::read_to_string(&names_path) {
            Ok(contents) => contents.lines().any(|line| !line.trim().is_empty() && exe_name.contains(line.trim())),
            Err(_) => true, // no allowlist file: config applies to all processes
        }
    }

    fn apply_env(&mut self) {
        if let Ok(level) = std::env::var("FFRT_LOG_LEVEL") {
            if let Ok(n) = level.parse::<u8>() {
                std::env::set_var("RUST_LOG", log_level_filter(n).to_string());
            }
        }
        if std::env::var("FFRT_PATH_HARDWARE").is_ok() {
            // Hardware-path override is consumed directly by callers that
            // need device-specific tuning; the runtime core only needs to
            // know the variable is present (propagated via env for the
            // cgroup-affinity call site in worker::thread).
        }
    }
}

/// Translate the `FFRT_LOG_LEVEL` (0-4) scale to a `log::LevelFilter`.
pub fn log_level_filter(n: u8) -> log::LevelFilter {
    match n {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        _ => log::LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_positive_worker_counts() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.cpu_worker_num.iter().all(|&n| n > 0));
        assert!(cfg.hard_limit.iter().all(|&n| n >= QOS_WORKER_MAXNUM));
    }

    #[test]
    fn toml_round_trip() {
        let cfg = RuntimeConfig::default();
        let text = toml::to_string(&cfg).expect("serialize");
        let back: RuntimeConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(back.default_stack_size, cfg.default_stack_size);
    }

    #[test]
    fn log_level_mapping() {
        assert_eq!(log_level_filter(0), log::LevelFilter::Off);
        assert_eq!(log_level_filter(4), log::LevelFilter::Trace);
        assert_eq!(log_level_filter(9), log::LevelFilter::Trace);
    }
}
