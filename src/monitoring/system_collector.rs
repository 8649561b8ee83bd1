//! Periodic sampler feeding host-level gauges into the metric registry.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::metrics::{MetricKind, MetricRegistry};

pub const MEMORY_TOTAL: &str = "system_memory_total_bytes";
pub const MEMORY_FREE: &str = "system_memory_free_bytes";
pub const MEMORY_USED_PERCENT: &str = "system_memory_used_percent";
pub const LOAD_AVERAGE_1M: &str = "system_load_average_1m";
pub const CPU_USAGE_PERCENT: &str = "system_cpu_usage_percent";
pub const PROCESS_UPTIME: &str = "process_uptime_seconds";

pub struct SystemCollector {
    registry: Arc<MetricRegistry>,
    interval: Duration,
    started_at: Instant,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SystemCollector {
    pub fn new(registry: Arc<MetricRegistry>, interval: Duration) -> Self {
        registry.register(MEMORY_TOTAL, MetricKind::Gauge, "Total system memory in bytes", &[]);
        registry.register(MEMORY_FREE, MetricKind::Gauge, "Free system memory in bytes", &[]);
        registry.register(
            MEMORY_USED_PERCENT,
            MetricKind::Gauge,
            "Used system memory as a percentage of total",
            &[],
        );
        registry.register(LOAD_AVERAGE_1M, MetricKind::Gauge, "One minute load average", &[]);
        registry.register(CPU_USAGE_PERCENT, MetricKind::Gauge, "Global CPU usage percentage", &[]);
        registry.register(PROCESS_UPTIME, MetricKind::Gauge, "Process uptime in seconds", &[]);

        Self {
            registry,
            interval,
            started_at: Instant::now(),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting system collector at {:?} interval", self.interval);

        let registry = self.registry.clone();
        let running = self.running.clone();
        let started_at = self.started_at;
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut sys = System::new();
            let mut ticker = tokio::time::interval(interval);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                sample(&registry, &mut sys, started_at);
            }
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        debug!("system collector stopped");
    }

    /// Take one sample immediately, outside the periodic loop.
    pub fn sample_now(&self) {
        let mut sys = System::new();
        sample(&self.registry, &mut sys, self.started_at);
    }
}

fn sample(registry: &MetricRegistry, sys: &mut System, started_at: Instant) {
    sys.refresh_memory();
    sys.refresh_cpu_usage();

    let no_labels = HashMap::new();
    let total = sys.total_memory() as f64;
    let free = sys.free_memory() as f64;
    let available = sys.available_memory() as f64;
    let used_percent = if total > 0.0 {
        (total - available) / total * 100.0
    } else {
        0.0
    };

    registry.record(MEMORY_TOTAL, total, &no_labels);
    registry.record(MEMORY_FREE, free, &no_labels);
    registry.record(MEMORY_USED_PERCENT, used_percent, &no_labels);
    registry.record(LOAD_AVERAGE_1M, System::load_average().one, &no_labels);
    registry.record(CPU_USAGE_PERCENT, sys.global_cpu_usage() as f64, &no_labels);
    registry.record(PROCESS_UPTIME, started_at.elapsed().as_secs_f64(), &no_labels);
}

impl Drop for SystemCollector {
    fn drop(&mut self) {
        self.stop();
    }
}
