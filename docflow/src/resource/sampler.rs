//! Host load sampling.
//!
//! # Platform Support
//!
//! - **Linux**: CPU from `/proc/stat` deltas, memory from `/proc/meminfo`
//! - **Other platforms**: reports zero load

use std::sync::Arc;

use parking_lot::Mutex;

/// Host CPU and memory load at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SystemLoad {
    /// Busy CPU across all cores, 0-100.
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
}

impl SystemLoad {
    pub fn memory_percent(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            return 0.0;
        }
        self.memory_used_bytes as f64 / self.memory_total_bytes as f64 * 100.0
    }
}

/// Source of host load samples.
pub trait SystemSampler: Send {
    fn sample(&mut self) -> SystemLoad;
}

// =============================================================================
// /proc sampler
// =============================================================================

/// Cumulative CPU jiffies from the aggregate `cpu` line of `/proc/stat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
///
/// Format: `cpu  user nice system idle iowait irq softirq steal ...`
pub fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().take(8).sum();
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Parses `/proc/meminfo` into `(total, available)` bytes.
pub fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        // Format: "MemTotal:       16384000 kB"
        let mut parts = line.split_whitespace();
        let key = parts.next();
        let value = parts.next().and_then(|v| v.parse::<u64>().ok());
        match (key, value) {
            (Some("MemTotal:"), Some(kb)) => total = Some(kb * 1024),
            (Some("MemAvailable:"), Some(kb)) => available = Some(kb * 1024),
            _ => {}
        }
    }
    Some((total?, available?))
}

/// Sampler reading `/proc` on Linux.
#[derive(Debug, Default)]
pub struct ProcSampler {
    last_cpu: Option<CpuTimes>,
}

impl ProcSampler {
    pub fn new() -> Self {
        Self::default()
    }

    fn cpu_percent(&mut self, current: Option<CpuTimes>) -> f64 {
        let Some(current) = current else {
            return 0.0;
        };
        let percent = match self.last_cpu {
            Some(last) if current.total > last.total => {
                let busy = current.busy.saturating_sub(last.busy) as f64;
                let total = (current.total - last.total) as f64;
                (busy / total * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };
        self.last_cpu = Some(current);
        percent
    }
}

impl SystemSampler for ProcSampler {
    #[cfg(target_os = "linux")]
    fn sample(&mut self) -> SystemLoad {
        use std::fs;

        let cpu = fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|s| parse_cpu_times(&s));
        let cpu_percent = self.cpu_percent(cpu);

        let (memory_total_bytes, memory_used_bytes) = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo(&s))
            .map(|(total, available)| (total, total.saturating_sub(available)))
            .unwrap_or((0, 0));

        SystemLoad {
            cpu_percent,
            memory_used_bytes,
            memory_total_bytes,
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&mut self) -> SystemLoad {
        let _ = self.cpu_percent(None);
        SystemLoad::default()
    }
}

// =============================================================================
// Manual sampler
// =============================================================================

/// Sampler returning whatever load was last set. Useful for embedding hosts
/// that measure load themselves, and for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualSampler {
    load: Arc<Mutex<SystemLoad>>,
}

impl ManualSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the load reported by subsequent samples. Clones share state.
    pub fn set(&self, load: SystemLoad) {
        *self.load.lock() = load;
    }
}

impl SystemSampler for ManualSampler {
    fn sample(&mut self) -> SystemLoad {
        *self.load.lock()
    }
}
