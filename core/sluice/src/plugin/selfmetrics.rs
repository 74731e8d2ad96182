//! Self-monitoring inputs for the builtin pipelines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::event::{Collector, LogEvent};
use crate::plugin::MetricInput;

/// Reports agent liveness: uptime and the number of collection rounds.
pub struct AlarmMetricInput {
    started: Instant,
    rounds: AtomicU64,
}

impl AlarmMetricInput {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            rounds: AtomicU64::new(0),
        }
    }
}

impl MetricInput for AlarmMetricInput {
    fn collect(&self, collector: &Collector) -> anyhow::Result<()> {
        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        collector.add(
            LogEvent::now()
                .with_field("metric", "agent_alarm")
                .with_field("uptime_s", self.started.elapsed().as_secs().to_string())
                .with_field("round", round.to_string()),
        );
        Ok(())
    }
}

/// Reports where the agent process itself is running.
pub struct ContainerMetricInput;

impl ContainerMetricInput {
    pub fn new() -> Self {
        Self
    }
}

impl MetricInput for ContainerMetricInput {
    fn collect(&self, collector: &Collector) -> anyhow::Result<()> {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("unknown"));
        collector.add(
            LogEvent::now()
                .with_field("metric", "agent_container")
                .with_field("hostname", hostname)
                .with_field("pid", std::process::id().to_string()),
        );
        Ok(())
    }
}
