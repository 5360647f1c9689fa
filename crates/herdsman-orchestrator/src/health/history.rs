//! Bounded history of health snapshots.

use std::collections::VecDeque;
use std::sync::RwLock;

use herdsman_core::{HealthSnapshot, Resource};
use serde::Serialize;

/// Average and peak utilization of one resource over a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceTrend {
    pub resource: Resource,
    pub average: f64,
    pub peak: f64,

    /// Snapshots the figures were computed from.
    pub samples: usize,
}

/// Fixed-capacity ring of snapshots, oldest first.
///
/// The sampler is the only writer. Readers always get copies, never a view
/// into the buffer.
#[derive(Debug)]
pub struct HealthHistory {
    capacity: usize,
    buffer: RwLock<VecDeque<HealthSnapshot>>,
}

impl HealthHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a snapshot, evicting the oldest when full.
    pub fn push(&self, snapshot: HealthSnapshot) {
        let mut buffer = match self.buffer.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(snapshot);
    }

    pub fn len(&self) -> usize {
        self.buffer.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.buffer.read().ok().and_then(|b| b.back().copied())
    }

    /// The most recent `limit` snapshots (all when `None`), oldest first.
    pub fn snapshot(&self, limit: Option<usize>) -> Vec<HealthSnapshot> {
        let Ok(buffer) = self.buffer.read() else {
            return Vec::new();
        };
        let skip = limit.map_or(0, |n| buffer.len().saturating_sub(n));
        buffer.iter().skip(skip).copied().collect()
    }

    /// Mean utilization of `resource` over the last `window` snapshots.
    pub fn average(&self, resource: Resource, window: usize) -> Option<f64> {
        let recent = self.snapshot(Some(window));
        if recent.is_empty() {
            return None;
        }
        let sum: f64 = recent.iter().map(|s| s.utilization(resource)).sum();
        Some(sum / recent.len() as f64)
    }

    /// Highest utilization of `resource` over the last `window` snapshots.
    pub fn peak(&self, resource: Resource, window: usize) -> Option<f64> {
        self.snapshot(Some(window))
            .iter()
            .map(|s| s.utilization(resource))
            .reduce(f64::max)
    }

    /// Average and peak of every resource over the last `window` snapshots,
    /// all from one copy of the ring. Empty until the first sample.
    pub fn trend(&self, window: usize) -> Vec<ResourceTrend> {
        let recent = self.snapshot(Some(window));
        if recent.is_empty() {
            return Vec::new();
        }
        Resource::ALL
            .iter()
            .map(|&resource| {
                let values = recent.iter().map(|s| s.utilization(resource));
                ResourceTrend {
                    resource,
                    average: values.clone().sum::<f64>() / recent.len() as f64,
                    peak: values.fold(0.0, f64::max),
                    samples: recent.len(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herdsman_core::ResourceUsage;

    fn snap(memory: f64) -> HealthSnapshot {
        HealthSnapshot::now(ResourceUsage::new(0.0, memory, 0.0))
    }

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let history = HealthHistory::new(3);
        for m in [0.1, 0.2, 0.3, 0.4] {
            history.push(snap(m));
        }
        let all = history.snapshot(None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].usage.memory, 0.2);
        assert_eq!(history.latest().unwrap().usage.memory, 0.4);
    }

    #[test]
    fn test_snapshot_limit_returns_most_recent() {
        let history = HealthHistory::new(10);
        for m in [0.1, 0.2, 0.3] {
            history.push(snap(m));
        }
        let recent = history.snapshot(Some(2));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].usage.memory, 0.2);
        assert_eq!(history.snapshot(Some(50)).len(), 3);
    }

    #[test]
    fn test_copies_are_independent() {
        let history = HealthHistory::new(4);
        history.push(snap(0.5));
        let copy = history.snapshot(None);
        history.push(snap(0.6));
        assert_eq!(copy.len(), 1);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_trend_queries() {
        let history = HealthHistory::new(10);
        assert!(history.average(Resource::Memory, 5).is_none());
        assert!(history.peak(Resource::Memory, 5).is_none());

        for m in [0.2, 0.9, 0.4] {
            history.push(snap(m));
        }
        let avg = history.average(Resource::Memory, 10).unwrap();
        assert!((avg - 0.5).abs() < 1e-9);
        assert_eq!(history.peak(Resource::Memory, 10), Some(0.9));
        assert_eq!(history.peak(Resource::Memory, 1), Some(0.4));
    }

    #[test]
    fn test_trend_covers_every_resource() {
        let history = HealthHistory::new(10);
        assert!(history.trend(5).is_empty());

        for m in [0.2, 0.9, 0.4] {
            history.push(snap(m));
        }
        let trend = history.trend(2);
        assert_eq!(trend.len(), Resource::ALL.len());

        let memory = trend.iter().find(|t| t.resource == Resource::Memory).unwrap();
        assert_eq!(memory.samples, 2);
        assert!((memory.average - 0.65).abs() < 1e-9);
        assert_eq!(memory.peak, 0.9);
        assert_eq!(memory.average, history.average(Resource::Memory, 2).unwrap());
        assert_eq!(Some(memory.peak), history.peak(Resource::Memory, 2));
    }
}
