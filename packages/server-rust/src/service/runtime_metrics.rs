//! Periodic process and runtime gauges.
//!
//! Enabled through `metrics.runtime.*`. CPU gauges report the available
//! parallelism and the tokio scheduler shape; memory gauges read the
//! resident and virtual size from `/proc/self/statm` where it exists.

use std::time::Duration;

use async_trait::async_trait;
use switchyard_core::{ConfigError, StaticConfig};

use super::metrics::ContextMetrics;
use super::worker::{BackgroundRunnable, BackgroundWorker};

pub const NUM_CPUS: &str = "runtime.num-cpus";
pub const NUM_WORKERS: &str = "runtime.num-workers";
pub const NUM_ALIVE_TASKS: &str = "runtime.num-alive-tasks";
pub const MEMORY_RSS: &str = "runtime.memory.rss";
pub const MEMORY_VIRTUAL: &str = "runtime.memory.virtual";

/// Linux page size assumed when converting `statm` pages to bytes.
const PAGE_SIZE: u64 = 4096;

/// Which gauge groups to collect and how often.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeMetricsOptions {
    pub enable_cpu_metrics: bool,
    pub enable_mem_metrics: bool,
    pub collect_interval: Duration,
}

impl Default for RuntimeMetricsOptions {
    fn default() -> Self {
        Self {
            enable_cpu_metrics: false,
            enable_mem_metrics: false,
            collect_interval: Duration::from_secs(1),
        }
    }
}

impl RuntimeMetricsOptions {
    /// Reads `metrics.runtime.enableCPUMetrics`, `enableMemMetrics` and
    /// `collectInterval` (milliseconds).
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a present key has the wrong type.
    pub fn from_config(config: &StaticConfig) -> Result<Self, ConfigError> {
        let interval_ms = config.int_or("metrics.runtime.collectInterval", 1000)?;
        Ok(Self {
            enable_cpu_metrics: config.bool_or("metrics.runtime.enableCPUMetrics", false)?,
            enable_mem_metrics: config.bool_or("metrics.runtime.enableMemMetrics", false)?,
            collect_interval: Duration::from_millis(u64::try_from(interval_ms.max(1)).unwrap_or(1000)),
        })
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enable_cpu_metrics || self.enable_mem_metrics
    }
}

/// Commands accepted by the collector worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorTask {
    /// Collect immediately instead of waiting for the next tick.
    CollectNow,
}

/// Emits runtime gauges on every tick.
pub struct RuntimeMetricsCollector {
    options: RuntimeMetricsOptions,
    metrics: ContextMetrics,
}

impl RuntimeMetricsCollector {
    #[must_use]
    pub fn new(options: RuntimeMetricsOptions, metrics: ContextMetrics) -> Self {
        Self { options, metrics }
    }

    fn collect(&self) {
        if self.options.enable_cpu_metrics {
            self.collect_cpu();
        }
        if self.options.enable_mem_metrics {
            self.collect_memory();
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn collect_cpu(&self) {
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        self.metrics.update_gauge(NUM_CPUS, cpus as f64);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let rt = handle.metrics();
            self.metrics.update_gauge(NUM_WORKERS, rt.num_workers() as f64);
            self.metrics.update_gauge(NUM_ALIVE_TASKS, rt.num_alive_tasks() as f64);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn collect_memory(&self) {
        match std::fs::read_to_string("/proc/self/statm") {
            Ok(raw) => {
                if let Some((virt, rss)) = parse_statm(&raw) {
                    self.metrics.update_gauge(MEMORY_VIRTUAL, (virt * PAGE_SIZE) as f64);
                    self.metrics.update_gauge(MEMORY_RSS, (rss * PAGE_SIZE) as f64);
                }
            }
            Err(err) => {
                tracing::trace!(error = %err, "memory statistics unavailable");
            }
        }
    }
}

/// First two fields of `/proc/self/statm`: total and resident pages.
fn parse_statm(raw: &str) -> Option<(u64, u64)> {
    let mut fields = raw.split_whitespace();
    let virt = fields.next()?.parse().ok()?;
    let rss = fields.next()?.parse().ok()?;
    Some((virt, rss))
}

#[async_trait]
impl BackgroundRunnable for RuntimeMetricsCollector {
    type Task = CollectorTask;

    async fn run(&mut self, task: CollectorTask) {
        match task {
            CollectorTask::CollectNow => self.collect(),
        }
    }

    async fn on_tick(&mut self) {
        self.collect();
    }

    async fn shutdown(&mut self) {
        tracing::debug!("runtime metrics collector stopped");
    }
}

/// Starts the collector, or returns `None` when every group is disabled.
#[must_use]
pub fn start_runtime_metrics(
    options: RuntimeMetricsOptions,
    metrics: ContextMetrics,
) -> Option<BackgroundWorker<RuntimeMetricsCollector>> {
    if !options.is_enabled() {
        return None;
    }
    let interval = options.collect_interval;
    Some(BackgroundWorker::start(
        RuntimeMetricsCollector::new(options, metrics),
        interval,
    ))
}
