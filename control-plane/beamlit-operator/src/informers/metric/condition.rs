//! Sustained-window reach detector.
//!
//! Tracks the subset of metric specs currently over target, keyed by their
//! canonical form. The condition fires once the subset has been non-empty
//! continuously for the configured window; it drops the instant the subset
//! empties.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::crd::MetricSpec;

#[derive(Debug)]
pub struct ConditionTracker {
    over_target: HashSet<String>,
    window: Duration,
    since: Option<Instant>,
}

impl ConditionTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            over_target: HashSet::new(),
            window,
            since: None,
        }
    }

    /// Records one metric's evaluation for this scrape.
    pub fn update(&mut self, metric: &MetricSpec, reached: bool, now: Instant) {
        let canonical = metric.canonical_key();
        if reached {
            let was_empty = self.over_target.is_empty();
            self.over_target.insert(canonical);
            if was_empty {
                self.since = Some(now);
            }
        } else {
            self.over_target.remove(&canonical);
            if self.over_target.is_empty() {
                self.since = None;
            }
        }
    }

    /// True iff some metric has been over target continuously for longer
    /// than the window.
    pub fn is_reached(&self, now: Instant) -> bool {
        match self.since {
            Some(since) => now.duration_since(since) > self.window,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::metrics::{
        MetricSourceType, MetricTarget, MetricTargetType,
        ResourceMetricSource, ResourceName,
    };

    fn cpu_metric(target: i32) -> MetricSpec {
        MetricSpec {
            source: MetricSourceType::Resource,
            resource: Some(ResourceMetricSource {
                name: ResourceName::Cpu,
                target: MetricTarget {
                    target_type: MetricTargetType::Utilization,
                    value: None,
                    average_value: None,
                    average_utilization: Some(target),
                },
            }),
            pods: None,
            object: None,
            container_resource: None,
            external: None,
        }
    }

    fn memory_metric() -> MetricSpec {
        MetricSpec {
            source: MetricSourceType::Resource,
            resource: Some(ResourceMetricSource {
                name: ResourceName::Memory,
                target: MetricTarget {
                    target_type: MetricTargetType::AverageValue,
                    value: None,
                    average_value: Some("1Gi".into()),
                    average_utilization: None,
                },
            }),
            pods: None,
            object: None,
            container_resource: None,
            external: None,
        }
    }

    const WINDOW: Duration = Duration::from_secs(5);

    #[test]
    fn fires_only_after_the_window_elapses() {
        let mut tracker = ConditionTracker::new(WINDOW);
        let start = Instant::now();
        tracker.update(&cpu_metric(80), true, start);
        assert!(!tracker.is_reached(start));
        assert!(!tracker.is_reached(start + WINDOW));
        assert!(tracker.is_reached(start + WINDOW + Duration::from_millis(1)));
    }

    #[test]
    fn drop_to_empty_clears_immediately() {
        let mut tracker = ConditionTracker::new(WINDOW);
        let start = Instant::now();
        tracker.update(&cpu_metric(80), true, start);
        let later = start + WINDOW + Duration::from_secs(1);
        assert!(tracker.is_reached(later));
        tracker.update(&cpu_metric(80), false, later);
        assert!(!tracker.is_reached(later));
    }

    #[test]
    fn since_time_is_anchored_to_first_breach() {
        let mut tracker = ConditionTracker::new(WINDOW);
        let start = Instant::now();
        tracker.update(&cpu_metric(80), true, start);
        // a second metric joining later does not restart the clock
        tracker.update(&memory_metric(), true, start + Duration::from_secs(3));
        assert!(tracker.is_reached(start + WINDOW + Duration::from_secs(1)));
        // dropping one of two keeps the condition alive
        tracker.update(
            &memory_metric(),
            false,
            start + WINDOW + Duration::from_secs(1),
        );
        assert!(tracker.is_reached(start + WINDOW + Duration::from_secs(2)));
    }

    #[test]
    fn duplicate_specs_collapse_to_one_entry() {
        let mut tracker = ConditionTracker::new(WINDOW);
        let start = Instant::now();
        tracker.update(&cpu_metric(80), true, start);
        tracker.update(&cpu_metric(80), true, start + Duration::from_secs(1));
        // removing the single canonical entry empties the set
        tracker.update(&cpu_metric(80), false, start + Duration::from_secs(2));
        assert!(!tracker.is_reached(start + WINDOW + Duration::from_secs(1)));
    }

    #[test]
    fn restart_after_clear_restarts_the_window() {
        let mut tracker = ConditionTracker::new(WINDOW);
        let start = Instant::now();
        tracker.update(&cpu_metric(80), true, start);
        tracker.update(&cpu_metric(80), false, start + Duration::from_secs(2));
        let second_breach = start + Duration::from_secs(10);
        tracker.update(&cpu_metric(80), true, second_breach);
        assert!(!tracker.is_reached(second_breach + Duration::from_secs(4)));
        assert!(
            tracker.is_reached(second_breach + WINDOW + Duration::from_secs(1))
        );
    }
}
