//! Host telemetry from procfs
//!
//! CPU usage is the busy share of jiffies between two consecutive samples;
//! the first sample reports the average since boot. GPU usage is not
//! measured here and stays unset.

use crate::executor::TelemetrySource;
use crate::node::{NodeCapabilities, NodeResources};
use async_trait::async_trait;
use nodemesh_common::error::{MeshError, Result};
use parking_lot::Mutex;
use tracing::trace;

const PROC_STAT: &str = "/proc/stat";
const PROC_MEMINFO: &str = "/proc/meminfo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuSample {
    idle: u64,
    total: u64,
}

/// Linux host telemetry
pub struct ProcTelemetry {
    gpu_count: u32,
    previous: Mutex<Option<CpuSample>>,
}

impl ProcTelemetry {
    pub fn new(gpu_count: u32) -> Self {
        Self {
            gpu_count,
            previous: Mutex::new(None),
        }
    }

    fn cpu_percent(&self, sample: CpuSample) -> f64 {
        let mut previous = self.previous.lock();
        let (idle, total) = match *previous {
            Some(prev) if sample.total > prev.total => {
                (sample.idle.saturating_sub(prev.idle), sample.total - prev.total)
            }
            _ => (sample.idle, sample.total),
        };
        *previous = Some(sample);

        if total == 0 {
            return 0.0;
        }
        (1.0 - idle as f64 / total as f64) * 100.0
    }
}

#[async_trait]
impl TelemetrySource for ProcTelemetry {
    async fn snapshot(&self) -> Result<NodeResources> {
        let stat = tokio::fs::read_to_string(PROC_STAT).await?;
        let sample = stat
            .lines()
            .next()
            .and_then(parse_cpu_line)
            .ok_or_else(|| MeshError::Parse(format!("Unexpected format in {}", PROC_STAT)))?;

        let meminfo = tokio::fs::read_to_string(PROC_MEMINFO).await?;
        let (total_kb, available_kb) = parse_meminfo(&meminfo)
            .ok_or_else(|| MeshError::Parse(format!("Unexpected format in {}", PROC_MEMINFO)))?;

        let cpu_percent = self.cpu_percent(sample);
        let memory_percent = if total_kb == 0 {
            0.0
        } else {
            (1.0 - available_kb as f64 / total_kb as f64) * 100.0
        };

        trace!(cpu_percent, memory_percent, "Sampled local telemetry");

        Ok(NodeResources {
            cpu_percent: Some(cpu_percent),
            memory_percent: Some(memory_percent),
            gpu_percent: None,
        })
    }

    fn capabilities(&self) -> NodeCapabilities {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let total_memory_bytes = std::fs::read_to_string(PROC_MEMINFO)
            .ok()
            .and_then(|content| parse_meminfo(&content))
            .map(|(total_kb, _)| total_kb * 1024)
            .unwrap_or(0);

        let mut capabilities = NodeCapabilities {
            gpu_available: self.gpu_count > 0,
            gpu_count: self.gpu_count,
            cpu_count,
            total_memory_bytes,
            ..Default::default()
        };
        capabilities
            .extra
            .insert("os".to_string(), serde_json::json!(std::env::consts::OS));
        capabilities
    }
}

/// Aggregate `cpu` line of /proc/stat
fn parse_cpu_line(line: &str) -> Option<CpuSample> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }

    let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }

    // idle + iowait count as idle time
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total = values.iter().take(8).sum();
    Some(CpuSample { idle, total })
}

/// (MemTotal, MemAvailable) in kB
fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse().ok()),
            Some("MemAvailable:") => available = parts.next().and_then(|v| v.parse().ok()),
            _ => {}
        }
    }

    Some((total?, available?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_line() {
        let sample = parse_cpu_line("cpu  100 0 50 800 50 0 0 0 0 0").unwrap();
        assert_eq!(sample.idle, 850);
        assert_eq!(sample.total, 1000);

        assert!(parse_cpu_line("cpu0 1 2 3 4").is_none());
        assert!(parse_cpu_line("cpu 1 2").is_none());
    }

    #[test]
    fn test_cpu_percent_uses_deltas() {
        let telemetry = ProcTelemetry::new(0);

        let first = telemetry.cpu_percent(CpuSample { idle: 900, total: 1000 });
        assert!((first - 10.0).abs() < 1e-9);

        // 100 more jiffies, half of them idle
        let second = telemetry.cpu_percent(CpuSample { idle: 950, total: 1100 });
        assert!((second - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        assert_eq!(parse_meminfo(content), Some((16_000_000, 4_000_000)));
        assert_eq!(parse_meminfo("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn test_capabilities_reflect_gpu_count() {
        let caps = ProcTelemetry::new(2).capabilities();
        assert!(caps.gpu_available);
        assert_eq!(caps.gpu_count, 2);
        assert!(caps.cpu_count >= 1);
    }
}
