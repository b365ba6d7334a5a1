// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host metrics sampled with `sysinfo` and published as `serverMetricsArray`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Disks, Networks, System};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::{Event, EventSink};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMetric {
    pub metric: String,
    pub count: f64,
    pub tag: &'static str,
}

impl SystemMetric {
    fn new(metric: impl Into<String>, count: f64, tag: &'static str) -> Self {
        Self {
            metric: metric.into(),
            count,
            tag,
        }
    }
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        (part / whole * 100.0).round()
    } else {
        0.0
    }
}

/// One pair per disk plus the aggregates. The total is the largest disk,
/// usage is summed over every disk.
pub fn disk_metrics(disks: &[(String, u64, u64)]) -> Vec<SystemMetric> {
    let mut metrics = Vec::with_capacity(disks.len() * 2 + 3);
    let mut used_sum = 0u64;
    let mut total = 0u64;
    for (name, used, size) in disks {
        metrics.push(SystemMetric::new(format!("system.disk.{name}.used"), *used as f64, "disk"));
        metrics.push(SystemMetric::new(format!("system.disk.{name}.size"), *size as f64, "disk"));
        used_sum = used_sum.saturating_add(*used);
        total = total.max(*size);
    }
    metrics.push(SystemMetric::new("system.disk.total", total as f64, "disk"));
    metrics.push(SystemMetric::new("system.disk.use", used_sum as f64, "disk"));
    metrics.push(SystemMetric::new(
        "system.disk.usagePercent",
        percent(used_sum as f64, total as f64),
        "disk",
    ));
    metrics
}

pub fn memory_metrics(total: u64, available: u64) -> Vec<SystemMetric> {
    let used = total.saturating_sub(available);
    vec![
        SystemMetric::new("system.memory.used", used as f64, "memory"),
        SystemMetric::new("system.memory.free", available as f64, "memory"),
        SystemMetric::new(
            "system.memory.usagePercent",
            percent(used as f64, total as f64),
            "memory",
        ),
    ]
}

/// Holds the `sysinfo` handles between samples so CPU usage has a baseline.
pub struct SystemSampler {
    system: System,
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }

    pub fn sample(&mut self) -> Vec<SystemMetric> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let disks = Disks::new_with_refreshed_list();
        let disks: Vec<(String, u64, u64)> = disks
            .iter()
            .map(|disk| {
                let size = disk.total_space();
                (
                    disk.name().to_string_lossy().into_owned(),
                    size.saturating_sub(disk.available_space()),
                    size,
                )
            })
            .collect();

        let mut metrics = disk_metrics(&disks);
        metrics.push(SystemMetric::new("uptime", System::uptime() as f64, "uptime"));
        let cpu = f64::from(self.system.global_cpu_usage());
        metrics.push(SystemMetric::new(
            "system.cpu.used",
            (cpu * 100.0).round() / 100.0,
            "cpu",
        ));
        metrics.extend(memory_metrics(
            self.system.total_memory(),
            self.system.available_memory(),
        ));

        let networks = Networks::new_with_refreshed_list();
        for (iface, data) in networks.iter() {
            metrics.push(SystemMetric::new(
                format!("network.{iface}.rx"),
                data.total_received() as f64,
                "networks",
            ));
            metrics.push(SystemMetric::new(
                format!("network.{iface}.tx"),
                data.total_transmitted() as f64,
                "networks",
            ));
        }
        metrics
    }
}

pub async fn run(period: Duration, sink: Arc<dyn EventSink>, cancel: CancellationToken) {
    let mut sampler = SystemSampler::new();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // first tick fires immediately; let the CPU baseline settle
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let metrics = sampler.sample();
                debug!("SYSTEM | Collected {} metrics", metrics.len());
                sink.emit(Event::ServerMetrics(metrics));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_aggregates() {
        let metrics = disk_metrics(&[
            ("sda1".to_string(), 40, 100),
            ("sdb1".to_string(), 10, 50),
        ]);
        assert_eq!(metrics.len(), 7);
        assert_eq!(metrics[0].metric, "system.disk.sda1.used");
        let find = |name: &str| metrics.iter().find(|m| m.metric == name).unwrap().count;
        assert_eq!(find("system.disk.total"), 100.0);
        assert_eq!(find("system.disk.use"), 50.0);
        assert_eq!(find("system.disk.usagePercent"), 50.0);
    }

    #[test]
    fn test_no_disks_does_not_divide_by_zero() {
        let metrics = disk_metrics(&[]);
        assert_eq!(metrics.len(), 3);
        assert_eq!(metrics[2].count, 0.0);
    }

    #[test]
    fn test_memory_metrics() {
        let metrics = memory_metrics(1000, 250);
        assert_eq!(metrics[0].count, 750.0);
        assert_eq!(metrics[1].count, 250.0);
        assert_eq!(metrics[2].count, 75.0);
        assert_eq!(metrics[2].tag, "memory");
    }

    #[test]
    fn test_sample_shape() {
        let metrics = SystemSampler::new().sample();
        assert!(metrics.iter().any(|m| m.metric == "uptime"));
        assert!(metrics.iter().any(|m| m.metric == "system.cpu.used"));
        assert!(metrics.iter().any(|m| m.metric == "system.memory.usagePercent"));

        let payload = Event::ServerMetrics(metrics).payload().unwrap();
        assert!(payload["data"].is_array());
        assert!(payload["data"][0]["tag"].is_string());
    }
}
