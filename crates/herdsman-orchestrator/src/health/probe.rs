//! Host resource readings.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use herdsman_core::ResourceUsage;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("{0} reading unavailable")]
    Unavailable(&'static str),
}

/// Source of utilization readings, sampled on the health interval.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> Result<ResourceUsage, HealthError>;
}

/// Reads CPU, memory, and disk usage of the local host.
pub struct SystemProbe {
    system: System,
    disk_path: PathBuf,
}

impl SystemProbe {
    /// `disk_path` selects the volume whose usage is reported: the disk with
    /// the longest mount point containing it.
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::everything()),
        );
        Self {
            system,
            disk_path: disk_path.into(),
        }
    }

    fn disk_usage(&self) -> Result<f64, HealthError> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| self.disk_path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .filter(|disk| disk.total_space() > 0)
            .map(|disk| 1.0 - disk.available_space() as f64 / disk.total_space() as f64)
            .ok_or(HealthError::Unavailable("disk"))
    }

    pub fn disk_path(&self) -> &Path {
        &self.disk_path
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&mut self) -> Result<ResourceUsage, HealthError> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(HealthError::Unavailable("memory"));
        }
        let memory = self.system.used_memory() as f64 / total as f64;
        let cpu = f64::from(self.system.global_cpu_usage()) / 100.0;
        let disk = self.disk_usage()?;

        Ok(ResourceUsage::new(cpu, memory, disk))
    }
}

/// Probe returning whatever reading was last set. A cleared reading fails.
#[derive(Debug, Clone, Default)]
pub struct FixedProbe {
    usage: Arc<Mutex<Option<ResourceUsage>>>,
}

impl FixedProbe {
    pub fn new(usage: ResourceUsage) -> Self {
        let probe = Self::default();
        probe.set(usage);
        probe
    }

    pub fn set(&self, usage: ResourceUsage) {
        if let Ok(mut slot) = self.usage.lock() {
            *slot = Some(usage);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.usage.lock() {
            *slot = None;
        }
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&mut self) -> Result<ResourceUsage, HealthError> {
        self.usage
            .lock()
            .ok()
            .and_then(|slot| *slot)
            .ok_or(HealthError::Unavailable("fixed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_probe_reads_fractions() {
        let mut probe = SystemProbe::new("/");
        // Containers may hide disks; only check what was readable.
        if let Ok(usage) = probe.sample() {
            for value in [usage.cpu, usage.memory, usage.disk] {
                assert!((0.0..=1.0).contains(&value));
            }
        }
    }

    #[test]
    fn test_fixed_probe() {
        let mut probe = FixedProbe::new(ResourceUsage::new(0.1, 0.2, 0.3));
        assert_eq!(probe.sample().unwrap().memory, 0.2);

        probe.clear();
        assert!(probe.sample().is_err());
    }
}
