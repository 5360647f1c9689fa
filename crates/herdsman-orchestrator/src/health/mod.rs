//! Periodic host health sampling.
//!
//! The [`HealthSampler`] reads a [`ResourceProbe`] on a fixed interval,
//! records every reading in the shared [`HealthHistory`], and emits a
//! [`HealthEvent`] for each resource at or above its warning threshold.
//! A failed reading is logged and skipped; sampling continues.

mod history;
mod probe;

use std::sync::Arc;
use std::time::Duration;

use herdsman_core::{HealthSnapshot, Resource};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{HealthConfig, Thresholds};

pub use history::{HealthHistory, ResourceTrend};
pub use probe::{FixedProbe, HealthError, ResourceProbe, SystemProbe};

/// Thresholds for every sampled resource.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceThresholds {
    pub cpu: Thresholds,
    pub memory: Thresholds,
    pub disk: Thresholds,
}

impl ResourceThresholds {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            cpu: config.cpu,
            memory: config.memory,
            disk: config.disk,
        }
    }

    pub fn get(&self, resource: Resource) -> Thresholds {
        match resource {
            Resource::Cpu => self.cpu,
            Resource::Memory => self.memory,
            Resource::Disk => self.disk,
        }
    }
}

/// Severity of a threshold crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// At or above the warning level. Logged only.
    Advisory,
    /// At or above the critical level. Triggers resource recovery.
    Critical,
}

/// One resource over one of its thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthEvent {
    pub severity: Severity,
    pub resource: Resource,
    pub utilization: f64,
    pub threshold: f64,
    pub snapshot: HealthSnapshot,
}

impl HealthEvent {
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// Events raised by one snapshot, in resource order.
pub fn evaluate(snapshot: &HealthSnapshot, thresholds: &ResourceThresholds) -> Vec<HealthEvent> {
    Resource::ALL
        .into_iter()
        .filter_map(|resource| {
            let utilization = snapshot.utilization(resource);
            let t = thresholds.get(resource);
            let (severity, threshold) = if utilization >= t.critical {
                (Severity::Critical, t.critical)
            } else if utilization >= t.warning {
                (Severity::Advisory, t.warning)
            } else {
                return None;
            };
            Some(HealthEvent {
                severity,
                resource,
                utilization,
                threshold,
                snapshot: *snapshot,
            })
        })
        .collect()
}

/// Samples a probe into the history and reports threshold crossings.
pub struct HealthSampler {
    probe: Box<dyn ResourceProbe>,
    history: Arc<HealthHistory>,
    thresholds: ResourceThresholds,
    interval: Duration,
}

impl HealthSampler {
    pub fn new(probe: Box<dyn ResourceProbe>, history: Arc<HealthHistory>) -> Self {
        Self {
            probe,
            history,
            thresholds: ResourceThresholds::default(),
            interval: Duration::from_secs(5),
        }
    }

    pub fn with_thresholds(mut self, thresholds: ResourceThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Take one reading. Returns the events it raised; a failed reading
    /// records nothing and raises nothing.
    pub fn tick(&mut self) -> Vec<HealthEvent> {
        let usage = match self.probe.sample() {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "Health sample failed, skipping");
                return Vec::new();
            }
        };

        let snapshot = HealthSnapshot::now(usage);
        self.history.push(snapshot);
        debug!(
            cpu = usage.cpu,
            memory = usage.memory,
            disk = usage.disk,
            "Health sampled"
        );

        let events = evaluate(&snapshot, &self.thresholds);
        for event in &events {
            match event.severity {
                Severity::Advisory => warn!(
                    resource = %event.resource,
                    utilization = event.utilization,
                    threshold = event.threshold,
                    "Resource above warning threshold"
                ),
                Severity::Critical => error!(
                    resource = %event.resource,
                    utilization = event.utilization,
                    threshold = event.threshold,
                    "Resource above critical threshold"
                ),
            }
        }
        events
    }

    /// Sample until `shutdown` fires, forwarding events to `events`.
    ///
    /// Events that do not fit in the channel are dropped so sampling never
    /// waits on the consumer.
    pub async fn run(mut self, events: mpsc::Sender<HealthEvent>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis() as u64, "Health sampler started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    for event in self.tick() {
                        match events.try_send(event) {
                            Ok(()) => {}
                            Err(TrySendError::Full(event)) => {
                                debug!(resource = %event.resource, "Health event dropped, consumer busy");
                            }
                            Err(TrySendError::Closed(_)) => {
                                debug!("Health event receiver gone, stopping sampler");
                                return;
                            }
                        }
                    }
                }
            }
        }

        info!("Health sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herdsman_core::ResourceUsage;

    fn sampler(probe: FixedProbe) -> (HealthSampler, Arc<HealthHistory>) {
        let history = Arc::new(HealthHistory::new(16));
        (HealthSampler::new(Box::new(probe), history.clone()), history)
    }

    #[test]
    fn test_evaluate_levels() {
        let snapshot = HealthSnapshot::now(ResourceUsage::new(0.5, 0.95, 0.80));
        let events = evaluate(&snapshot, &ResourceThresholds::default());

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].resource, Resource::Memory);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[0].threshold, 0.90);
        assert_eq!(events[1].resource, Resource::Disk);
        assert_eq!(events[1].severity, Severity::Advisory);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let snapshot = HealthSnapshot::now(ResourceUsage::new(0.90, 0.0, 0.0));
        let events = evaluate(&snapshot, &ResourceThresholds::default());
        assert!(events[0].is_critical());
    }

    #[test]
    fn test_tick_records_and_skips_failures() {
        let probe = FixedProbe::new(ResourceUsage::new(0.1, 0.1, 0.1));
        let (mut sampler, history) = sampler(probe.clone());

        assert!(sampler.tick().is_empty());
        assert_eq!(history.len(), 1);

        probe.clear();
        assert!(sampler.tick().is_empty());
        assert_eq!(history.len(), 1);

        probe.set(ResourceUsage::new(0.1, 0.97, 0.1));
        let events = sampler.tick();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_critical());
        assert_eq!(history.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_forwards_events_until_shutdown() {
        let probe = FixedProbe::new(ResourceUsage::new(0.0, 0.95, 0.0));
        let (sampler, history) = sampler(probe);
        let sampler = sampler.with_interval(Duration::from_millis(10));

        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(sampler.run(tx, shutdown.clone()));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.resource, Resource::Memory);
        assert!(event.is_critical());

        shutdown.cancel();
        task.await.unwrap();
        assert!(!history.is_empty());
    }
}
