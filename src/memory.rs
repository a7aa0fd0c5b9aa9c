//! Process memory accounting and native-allocator control.
//!
//! The orchestrator budgets against `max(heap_inuse, rss)`: heap figures
//! come from the allocator where glibc exposes them, RSS from
//! `/proc/self/statm`. Native trims hand freed arena pages back to the OS
//! between chunks and after spills.

use tracing::debug;

use crate::error::{EngineError, Result};

/// Budget fraction at which pressure turns critical.
pub const CRITICAL_PCT: u64 = 90;
/// Budget fraction at which pressure starts logging warnings.
pub const WARNING_PCT: u64 = 80;

/// Point-in-time memory reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    /// Allocator-reported in-use heap bytes (falls back to RSS).
    pub heap_bytes: u64,
    /// Resident-set size in bytes.
    pub rss_bytes: u64,
}

impl MemorySnapshot {
    /// Capture the current process figures.
    pub fn capture() -> Self {
        let rss_bytes = read_rss();
        let heap_bytes = heap_in_use().unwrap_or(rss_bytes);
        Self {
            heap_bytes,
            rss_bytes,
        }
    }

    /// The figure budgeting runs against.
    pub fn used(&self) -> u64 {
        self.heap_bytes.max(self.rss_bytes)
    }

    /// Growth since `before`: the larger of the heap and RSS deltas.
    pub fn delta_since(&self, before: &MemorySnapshot) -> u64 {
        let heap = self.heap_bytes.saturating_sub(before.heap_bytes);
        let rss = self.rss_bytes.saturating_sub(before.rss_bytes);
        heap.max(rss)
    }
}

/// How close the process is to its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    /// Comfortably under budget.
    None,
    /// At or above 80% of budget.
    Warning,
    /// At or above 90% of budget.
    Critical,
}

/// Classify `used` against `budget` (≤ 0 means unlimited).
pub fn pressure_level(used: u64, budget: i64) -> PressureLevel {
    if budget <= 0 {
        return PressureLevel::None;
    }
    let budget = budget as u64;
    if used * 100 >= budget * CRITICAL_PCT {
        PressureLevel::Critical
    } else if used * 100 >= budget * WARNING_PCT {
        PressureLevel::Warning
    } else {
        PressureLevel::None
    }
}

#[cfg(target_os = "linux")]
fn read_rss() -> u64 {
    let statm = match std::fs::read_to_string("/proc/self/statm") {
        Ok(s) => s,
        Err(_) => return 0,
    };
    let pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|f| f.parse().ok())
        .unwrap_or(0);
    pages * page_size()
}

#[cfg(not(target_os = "linux"))]
fn read_rss() -> u64 {
    0
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    // SAFETY: sysconf with a valid name has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn heap_in_use() -> Option<u64> {
    // SAFETY: mallinfo2 reads allocator statistics without side effects.
    let info = unsafe { libc::mallinfo2() };
    Some(info.uordblks as u64)
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn heap_in_use() -> Option<u64> {
    None
}

/// Ask the native allocator to return freed pages to the OS.
pub fn trim_native_allocator() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: malloc_trim(0) only releases free arena memory.
        let released = unsafe { libc::malloc_trim(0) };
        debug!(released, "native allocator trim");
    }
}

/// Process-wide runtime tuning, applied once at the start of the first
/// chunk and held for the process lifetime. Never retriggered mid-chunk.
#[derive(Debug, Default)]
pub struct RuntimeTuning {
    ballast: Option<Vec<u8>>,
    applied: bool,
}

impl RuntimeTuning {
    /// Unapplied tuning handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the one-shot knobs. A second call is a no-op.
    ///
    /// `gc_percent` scales the allocator trim threshold: lower values
    /// release free pages sooner at the cost of more page traffic.
    /// `ballast_size` holds a fixed allocation for the process lifetime to
    /// smooth allocator growth spikes.
    pub fn apply(&mut self, gc_percent: Option<u32>, ballast_size: u64) -> Result<()> {
        if self.applied {
            return Ok(());
        }
        self.applied = true;

        if let Some(percent) = gc_percent {
            set_trim_threshold(percent)?;
        }
        if ballast_size > 0 {
            self.ballast = Some(vec![0u8; ballast_size as usize]);
            debug!(ballast_size, "ballast allocated");
        }
        Ok(())
    }

    /// Whether `apply` already ran.
    pub fn applied(&self) -> bool {
        self.applied
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn set_trim_threshold(gc_percent: u32) -> Result<()> {
    const BASE_THRESHOLD: u32 = 128 * 1024;
    let threshold = (BASE_THRESHOLD as u64 * gc_percent as u64 / 100).max(4096) as libc::c_int;
    // SAFETY: mallopt with M_TRIM_THRESHOLD only adjusts a tunable.
    let rc = unsafe { libc::mallopt(libc::M_TRIM_THRESHOLD, threshold) };
    if rc != 1 {
        tracing::warn!(gc_percent, "mallopt rejected trim threshold");
    }
    Ok(())
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn set_trim_threshold(gc_percent: u32) -> Result<()> {
    let _ = gc_percent;
    Ok(())
}

/// Validate a `--gc-percent` value.
pub fn validate_gc_percent(value: i64) -> Result<u32> {
    if value < 0 {
        return Err(EngineError::Config(format!(
            "gc percent must be non-negative, got {value}"
        )));
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_thresholds() {
        let budget = 1000;
        assert_eq!(pressure_level(100, budget), PressureLevel::None);
        assert_eq!(pressure_level(799, budget), PressureLevel::None);
        assert_eq!(pressure_level(800, budget), PressureLevel::Warning);
        assert_eq!(pressure_level(899, budget), PressureLevel::Warning);
        assert_eq!(pressure_level(900, budget), PressureLevel::Critical);
        assert_eq!(pressure_level(5000, budget), PressureLevel::Critical);
    }

    #[test]
    fn unlimited_budget_never_pressures() {
        assert_eq!(pressure_level(u64::MAX, 0), PressureLevel::None);
        assert_eq!(pressure_level(u64::MAX, -1), PressureLevel::None);
    }

    #[test]
    fn delta_takes_the_larger_axis() {
        let before = MemorySnapshot {
            heap_bytes: 100,
            rss_bytes: 200,
        };
        let after = MemorySnapshot {
            heap_bytes: 400,
            rss_bytes: 250,
        };
        assert_eq!(after.delta_since(&before), 300);
        assert_eq!(before.delta_since(&after), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn capture_reads_nonzero_rss() {
        let snapshot = MemorySnapshot::capture();
        assert!(snapshot.rss_bytes > 0);
        assert!(snapshot.used() >= snapshot.rss_bytes.min(snapshot.heap_bytes));
    }

    #[test]
    fn tuning_applies_once() {
        let mut tuning = RuntimeTuning::new();
        tuning.apply(None, 1024).expect("apply");
        assert!(tuning.applied());
        tuning.apply(None, 1 << 30).expect("second apply is a no-op");
        assert!(tuning.ballast.as_ref().map(Vec::len) == Some(1024));
    }

    #[test]
    fn gc_percent_rejects_negative() {
        assert!(validate_gc_percent(-1).is_err());
        assert_eq!(validate_gc_percent(75).expect("valid"), 75);
    }
}
