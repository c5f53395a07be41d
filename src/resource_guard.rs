// Resource admission check (§4.5 "Resource admission"), grounded on
// the original scheduler's pre-dispatch memory probe. Degrades to
// "ok" on any read failure rather than ever blocking the scheduler
// because of a monitoring glitch.

use sysinfo::System;

#[derive(Debug, Clone, Copy)]
pub struct ResourceStatus {
    pub ok: bool,
    pub memory_percent: f32,
    pub available_mb: u64,
}

pub struct ResourceGuard {
    max_memory_percent: f32,
    min_available_mb: u64,
}

impl ResourceGuard {
    pub fn new(max_memory_percent: f32, min_available_mb: u64) -> Self {
        Self {
            max_memory_percent,
            min_available_mb,
        }
    }

    /// Returns whether there is enough headroom to dispatch another
    /// task. Any failure to read system memory stats is treated as
    /// "ok" — a monitoring outage should never itself block the
    /// scheduler.
    pub fn check(&self) -> ResourceStatus {
        let mut sys = System::new();
        sys.refresh_memory();

        let total = sys.total_memory();
        if total == 0 {
            return ResourceStatus {
                ok: true,
                memory_percent: 0.0,
                available_mb: u64::MAX,
            };
        }

        let used = sys.used_memory();
        let available_mb = sys.available_memory() / (1024 * 1024);
        let memory_percent = (used as f64 / total as f64 * 100.0) as f32;

        let ok = memory_percent < self.max_memory_percent && available_mb > self.min_available_mb;

        ResourceStatus {
            ok,
            memory_percent,
            available_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_thresholds_pass() {
        let guard = ResourceGuard::new(100.0, 0);
        let status = guard.check();
        assert!(status.ok);
    }

    #[test]
    fn impossible_threshold_fails() {
        let guard = ResourceGuard::new(0.0, u64::MAX);
        let status = guard.check();
        assert!(!status.ok);
    }
}
