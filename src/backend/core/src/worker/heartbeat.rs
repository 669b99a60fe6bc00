//! Worker resource sampling for heartbeats.

use sysinfo::System;

/// Samples CPU load and process memory for heartbeat upserts.
pub struct ResourceSampler {
    system: System,
    pid: Option<sysinfo::Pid>,
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Refresh and return `(cpu_load_percent, memory_mb)`.
    pub fn sample(&mut self) -> (f32, u64) {
        self.system.refresh_cpu();
        let cpu = self.system.global_cpu_info().cpu_usage();

        let memory_mb = match self.pid {
            Some(pid) => {
                self.system
                    .refresh_process(pid);
                self.system
                    .process(pid)
                    .map(|p| p.memory() / (1024 * 1024))
                    .unwrap_or(0)
            }
            None => 0,
        };

        (cpu, memory_mb)
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_returns_plausible_values() {
        let mut sampler = ResourceSampler::new();
        let (cpu, memory_mb) = sampler.sample();
        assert!(cpu >= 0.0);
        assert!(memory_mb < 1024 * 1024);
    }
}
