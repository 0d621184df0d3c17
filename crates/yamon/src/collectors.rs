// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in host collectors backed by files under `/proc`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::envelope::Metric;
use crate::errors::CollectError;
use crate::scheduler::{Collector, CollectorRegistry};
use crate::sink::Sink;

const PROC_ROOT: &str = "/proc";

/// Counter columns of the per-cpu lines in /proc/stat, in file order.
const CPU_KEYS: [&str; 7] = ["user", "nice", "system", "idle", "iowait", "irq", "softirq"];

/// Per-device columns of /proc/diskstats after major, minor and name. Older
/// kernels stop after `weighted_time_spent_doing_io`.
const DISK_KEYS: [&str; 17] = [
    "reads_completed",
    "reads_merged",
    "sectors_read",
    "time_spent_reading",
    "writes_completed",
    "writes_merged",
    "sectors_written",
    "time_spent_writing",
    "io_in_progress",
    "time_spent_doing_io",
    "weighted_time_spent_doing_io",
    "discards_completed",
    "discards_merged",
    "sectors_discarded",
    "time_spent_discarding",
    "flush_requests_completed",
    "time_spent_flushing",
];

/// (metric, column) pairs of /proc/net/dev after the interface name.
const NET_COLUMNS: [(&str, usize); 8] = [
    ("net.rx.bytes", 0),
    ("net.rx.packets", 1),
    ("net.rx.errors", 2),
    ("net.rx.drop", 3),
    ("net.tx.bytes", 8),
    ("net.tx.packets", 9),
    ("net.tx.errors", 10),
    ("net.tx.drop", 11),
];

const IGNORED_DEVICE_PREFIXES: [&str; 1] = ["loop"];
const IGNORED_IFACE_PREFIXES: [&str; 2] = ["veth", "br-"];

type Parser = fn(&str) -> Result<Vec<Metric>, CollectError>;

/// Reads one proc file per run and emits what `parse` extracts from it.
pub struct ProcFileCollector {
    name: &'static str,
    path: PathBuf,
    parse: Parser,
}

impl ProcFileCollector {
    fn new(name: &'static str, root: &Path, file: &str, parse: Parser) -> Self {
        ProcFileCollector {
            name,
            path: root.join(file),
            parse,
        }
    }

    pub fn load(root: &Path) -> Self {
        Self::new("load", root, "loadavg", parse_loadavg)
    }

    pub fn memory(root: &Path) -> Self {
        Self::new("memory", root, "meminfo", parse_meminfo)
    }

    pub fn uptime(root: &Path) -> Self {
        Self::new("uptime", root, "uptime", parse_uptime)
    }

    pub fn vmstat(root: &Path) -> Self {
        Self::new("vmstat", root, "vmstat", parse_vmstat)
    }

    pub fn cpu(root: &Path) -> Self {
        Self::new("cpu", root, "stat", parse_stat)
    }

    pub fn disk_io(root: &Path) -> Self {
        Self::new("disk_io", root, "diskstats", parse_diskstats)
    }

    pub fn net(root: &Path) -> Self {
        Self::new("net", root, "net/dev", parse_net_dev)
    }
}

#[async_trait]
impl Collector for ProcFileCollector {
    fn name(&self) -> &str {
        self.name
    }

    async fn collect(&self, sink: &dyn Sink) -> Result<(), CollectError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        for metric in (self.parse)(&contents)? {
            sink.write_metric(metric);
        }
        Ok(())
    }
}

/// Registers every built-in collector reading from the live `/proc`.
pub fn register_builtin(registry: &mut CollectorRegistry) {
    register_builtin_at(registry, Path::new(PROC_ROOT));
}

pub fn register_builtin_at(registry: &mut CollectorRegistry, root: &Path) {
    registry.register(Arc::new(ProcFileCollector::cpu(root)));
    registry.register(Arc::new(ProcFileCollector::disk_io(root)));
    registry.register(Arc::new(ProcFileCollector::load(root)));
    registry.register(Arc::new(ProcFileCollector::memory(root)));
    registry.register(Arc::new(ProcFileCollector::net(root)));
    registry.register(Arc::new(ProcFileCollector::uptime(root)));
    registry.register(Arc::new(ProcFileCollector::vmstat(root)));
}

fn parse_field(source: &str, field: Option<&str>) -> Result<f64, CollectError> {
    let field = field.ok_or_else(|| CollectError::parse(source, "missing field"))?;
    field
        .parse::<f64>()
        .map_err(|e| CollectError::parse(source, format!("'{field}': {e}")))
}

pub fn parse_loadavg(contents: &str) -> Result<Vec<Metric>, CollectError> {
    let mut fields = contents.split_whitespace();
    let mut metrics = Vec::with_capacity(3);
    for name in ["load.1", "load.5", "load.15"] {
        metrics.push(Metric::gauge(name, parse_field("loadavg", fields.next())?));
    }
    Ok(metrics)
}

pub fn parse_uptime(contents: &str) -> Result<Vec<Metric>, CollectError> {
    let uptime = parse_field("uptime", contents.split_whitespace().next())?;
    Ok(vec![Metric::gauge("uptime", uptime)])
}

/// Memory gauges in bytes. `used` excludes buffers and page cache.
pub fn parse_meminfo(contents: &str) -> Result<Vec<Metric>, CollectError> {
    let mut total = None;
    let mut free = None;
    let mut available = None;
    let mut buffers = 0.0;
    let mut cached = 0.0;

    for line in contents.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(Ok(kib)) = rest.split_whitespace().next().map(str::parse::<f64>) else {
            continue;
        };
        let bytes = kib * 1024.0;
        match key {
            "MemTotal" => total = Some(bytes),
            "MemFree" => free = Some(bytes),
            "MemAvailable" => available = Some(bytes),
            "Buffers" => buffers = bytes,
            "Cached" | "SReclaimable" => cached += bytes,
            _ => {}
        }
    }

    let total = total.ok_or_else(|| CollectError::parse("meminfo", "missing MemTotal"))?;
    let free = free.ok_or_else(|| CollectError::parse("meminfo", "missing MemFree"))?;
    let used = (total - free - buffers - cached).max(0.0);

    let mut metrics = vec![
        Metric::gauge("memory.total", total),
        Metric::gauge("memory.used", used),
        Metric::gauge("memory.cached", cached),
        Metric::gauge("memory.free", free),
    ];
    if let Some(available) = available {
        metrics.push(Metric::gauge("memory.available", available));
    }
    Ok(metrics)
}

pub fn parse_vmstat(contents: &str) -> Result<Vec<Metric>, CollectError> {
    let mut metrics = Vec::new();
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        match value.parse::<u64>() {
            #[allow(clippy::cast_precision_loss)]
            Ok(value) => metrics.push(Metric::counter(format!("vmstat.{name}"), value as f64)),
            Err(_) => warn!("Skipping malformed vmstat line: {line}"),
        }
    }
    Ok(metrics)
}

/// Per-cpu time counters plus the context switch counter from /proc/stat.
pub fn parse_stat(contents: &str) -> Result<Vec<Metric>, CollectError> {
    let mut metrics = Vec::new();
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("ctxt") => {
                metrics.push(Metric::counter("cpu.ctxt", parse_field("stat", parts.next())?));
            }
            Some(label) if label.starts_with("cpu") && label != "cpu" => {
                let id = &label[3..];
                for key in CPU_KEYS {
                    let value = parse_field("stat", parts.next())?;
                    metrics.push(Metric::counter(format!("cpu.{key}"), value).with_tag("cpu", id));
                }
            }
            _ => {}
        }
    }
    Ok(metrics)
}

fn parse_counter(source: &str, value: &str) -> Option<f64> {
    match value.parse::<u64>() {
        #[allow(clippy::cast_precision_loss)]
        Ok(value) => Some(value as f64),
        Err(_) => {
            warn!("Skipping malformed {source} value '{value}'");
            None
        }
    }
}

/// I/O counters per block device, tagged `device`. Loop devices are skipped.
pub fn parse_diskstats(contents: &str) -> Result<Vec<Metric>, CollectError> {
    let mut metrics = Vec::new();
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let (Some(_major), Some(_minor), Some(device)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        if IGNORED_DEVICE_PREFIXES.iter().any(|p| device.starts_with(p)) {
            continue;
        }
        for (key, value) in DISK_KEYS.iter().zip(parts) {
            if let Some(value) = parse_counter("diskstats", value) {
                metrics.push(Metric::counter(format!("disk.{key}"), value).with_tag("device", device));
            }
        }
    }
    Ok(metrics)
}

/// Traffic counters per interface, tagged `iface`. Container veth pairs and
/// bridges are skipped.
pub fn parse_net_dev(contents: &str) -> Result<Vec<Metric>, CollectError> {
    let mut metrics = Vec::new();
    // Two header lines.
    for line in contents.lines().skip(2) {
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        let iface = iface.trim();
        if iface.is_empty() || IGNORED_IFACE_PREFIXES.iter().any(|p| iface.starts_with(p)) {
            continue;
        }
        let columns: Vec<&str> = rest.split_whitespace().collect();
        for (name, column) in NET_COLUMNS {
            let Some(value) = columns.get(column) else {
                return Err(CollectError::parse("net/dev", format!("{iface}: missing column {column}")));
            };
            if let Some(value) = parse_counter("net/dev", value) {
                metrics.push(Metric::counter(name, value).with_tag("iface", iface));
            }
        }
    }
    Ok(metrics)
}
