//! Host health types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// A sampled host resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Cpu,
    Memory,
    Disk,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Cpu, Resource::Memory, Resource::Disk];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| CoreError::UnknownResource(s.to_string()))
    }
}

/// Utilization ratios in `[0, 1]` for each resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

impl ResourceUsage {
    /// Build a usage value, clamping every ratio into `[0, 1]`.
    ///
    /// NaN is treated as zero.
    pub fn new(cpu: f64, memory: f64, disk: f64) -> Self {
        fn clamp(v: f64) -> f64 {
            if v.is_nan() {
                0.0
            } else {
                v.clamp(0.0, 1.0)
            }
        }
        Self {
            cpu: clamp(cpu),
            memory: clamp(memory),
            disk: clamp(disk),
        }
    }

    pub fn get(&self, resource: Resource) -> f64 {
        match resource {
            Resource::Cpu => self.cpu,
            Resource::Memory => self.memory,
            Resource::Disk => self.disk,
        }
    }
}

/// One health sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub usage: ResourceUsage,
}

impl HealthSnapshot {
    pub fn now(usage: ResourceUsage) -> Self {
        Self {
            timestamp: Utc::now(),
            usage,
        }
    }

    pub fn utilization(&self, resource: Resource) -> f64 {
        self.usage.get(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_is_clamped() {
        let usage = ResourceUsage::new(1.7, -0.2, f64::NAN);
        assert_eq!(usage.cpu, 1.0);
        assert_eq!(usage.memory, 0.0);
        assert_eq!(usage.disk, 0.0);
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let snapshot = HealthSnapshot::now(ResourceUsage::new(0.1, 0.2, 0.3));
        let value = serde_json::to_value(snapshot).unwrap();
        assert_eq!(value["memory"], 0.2);
        assert!(value.get("timestamp").is_some());
    }
}
