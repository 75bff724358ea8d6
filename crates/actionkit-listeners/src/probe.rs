use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

/// Source of memory usage readings, in bytes.
pub trait MemoryProbe: Send + Sync {
    fn current_usage(&self) -> u64;
    fn peak_usage(&self) -> u64;
}

/// Samples the physical memory of this process through `memory-stats`.
///
/// The peak is the highest sample seen since construction. When the
/// platform gives no reading the last sample is reported again.
#[derive(Debug, Default)]
pub struct ProcessMemoryProbe {
    last: AtomicU64,
    peak: AtomicU64,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let probe = Self::default();
        probe.sample();
        probe
    }

    fn sample(&self) -> u64 {
        let Some(stats) = memory_stats::memory_stats() else {
            warn!("process memory statistics unavailable");
            return self.last.load(Ordering::Relaxed);
        };
        let current = stats.physical_mem as u64;
        self.last.store(current, Ordering::Relaxed);
        self.peak.fetch_max(current, Ordering::Relaxed);
        current
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn current_usage(&self) -> u64 {
        self.sample()
    }

    fn peak_usage(&self) -> u64 {
        self.sample();
        self.peak.load(Ordering::Relaxed)
    }
}

/// Probe driven by hand, for deterministic tests and demos.
#[derive(Debug, Default)]
pub struct ManualMemoryProbe {
    current: AtomicU64,
    peak: AtomicU64,
}

impl ManualMemoryProbe {
    pub fn new(initial: u64) -> Self {
        Self {
            current: AtomicU64::new(initial),
            peak: AtomicU64::new(initial),
        }
    }

    /// Set current usage. The peak only ever grows.
    pub fn set(&self, bytes: u64) {
        self.current.store(bytes, Ordering::SeqCst);
        self.peak.fetch_max(bytes, Ordering::SeqCst);
    }

    pub fn allocate(&self, bytes: u64) {
        let now = self.current.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn release(&self, bytes: u64) {
        let _ = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(bytes))
            });
    }
}

impl MemoryProbe for ManualMemoryProbe {
    fn current_usage(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    fn peak_usage(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_memory_is_sampled_from_the_os() {
        let probe = ProcessMemoryProbe::new();
        let before = probe.current_usage();
        assert!(before > 0);

        let ballast = vec![1u8; 8 * 1024 * 1024];
        let during = probe.current_usage();
        assert!(probe.peak_usage() >= during.max(before));
        drop(ballast);
    }

    #[test]
    fn manual_probe_tracks_peak() {
        let probe = ManualMemoryProbe::new(100);
        probe.allocate(400);
        probe.release(300);
        assert_eq!(probe.current_usage(), 200);
        assert_eq!(probe.peak_usage(), 500);
        probe.set(50);
        assert_eq!(probe.peak_usage(), 500);
    }
}
