//! Execution of a pipeline's plugins.
//!
//! Two runner generations exist; call sites dispatch purely through the
//! [`PluginRunner`] trait and never inspect the concrete variant.

pub(crate) mod v1;
pub(crate) mod v2;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::control::AsyncControl;
use crate::event::{Collector, LogBatch, LogEvent};
use crate::plugin::{Flusher, MetricInput, PluginInstance, PluginKind, Processor, ServiceInput};
use crate::util::panic::payload_str;

/// Capability interface of a pipeline's plugin executor.
pub trait PluginRunner: Send + Sync {
    /// Whether the pipeline owns an input stage (metric or service plugins).
    fn is_with_input_plugin(&self) -> bool;

    /// Runs the plugins of one kind under `control`.
    fn run_plugins(&self, kind: PluginKind, control: &AsyncControl);

    /// Starts every stage of the pipeline on its internal controls.
    fn run(&self);

    /// Stops every stage, draining buffered data to the flushers.
    ///
    /// Blocking: waits for the plugins to finish, and hangs for as long as a
    /// plugin's stop hangs. Must not be called from an async context; the
    /// deadline-bound stop executor runs it on a dedicated thread.
    fn stop(&self, removed: bool) -> anyhow::Result<()>;

    /// Clears every back-reference to the owning pipeline.
    fn detach(&self);

    /// True once [`detach`](Self::detach) has cleared every back-reference.
    fn detached(&self) -> bool;

    /// Events accumulated in the aggregation stage but not yet flushed.
    fn buffered_events(&self) -> usize;
}

/// Tuning shared by both runner generations.
#[derive(Debug, Clone)]
pub struct RunnerParams {
    pub input_interval: Duration,
    pub flush_interval: Duration,
    pub queue_size: usize,
}

impl Default for RunnerParams {
    fn default() -> Self {
        Self {
            input_interval: Duration::from_secs(30),
            flush_interval: Duration::from_secs(3),
            queue_size: 256,
        }
    }
}

/// Spawns the poll loop of one metric input.
///
/// The first round runs immediately. This also serves the forced final
/// collection at shutdown: running the metric plugins under a fresh control
/// and cancelling it right away still yields one complete round.
pub(crate) fn spawn_metric_loop(
    control: &AsyncControl,
    inst: Arc<PluginInstance<dyn MetricInput>>,
    collector: Collector,
    period: Duration,
) {
    let token = control.token();
    control.spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticks.tick().await; // the immediate first tick
        loop {
            collect_round(&inst, &collector);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticks.tick() => {}
            }
        }
    });
}

fn collect_round(inst: &PluginInstance<dyn MetricInput>, collector: &Collector) {
    if let Err(e) = inst.plugin().collect(collector) {
        match inst.context() {
            Some(ctx) => log::error!(
                "input '{}' of {} failed to collect: {e:#}",
                inst.name(),
                ctx.runtime_context()
            ),
            None => log::error!("input '{}' failed to collect: {e:#}", inst.name()),
        }
    }
}

/// Spawns the blocking run loop of one service input.
pub(crate) fn spawn_service(
    control: &AsyncControl,
    inst: Arc<PluginInstance<dyn ServiceInput>>,
    collector: Collector,
) {
    control.spawn_blocking(move || {
        if let Err(e) = inst.plugin().start(collector) {
            match inst.context() {
                Some(ctx) => log::error!(
                    "service input '{}' of {} stopped with an error: {e:#}",
                    inst.name(),
                    ctx.runtime_context()
                ),
                None => log::error!("service input '{}' stopped with an error: {e:#}", inst.name()),
            }
        }
    });
}

/// Applies the processor chain in configuration order.
pub(crate) fn apply_processors(
    processors: &[Arc<PluginInstance<dyn Processor>>],
    mut events: Vec<LogEvent>,
) -> Vec<LogEvent> {
    for p in processors {
        events = p.plugin().process(events);
    }
    events
}

/// Hands one batch to every flusher, on the blocking pool.
pub(crate) async fn flush_batch(flushers: &[Arc<PluginInstance<dyn Flusher>>], batch: &LogBatch) {
    for inst in flushers {
        let name = inst.name().to_owned();
        let inst = Arc::clone(inst);
        let batch = batch.clone();
        match tokio::task::spawn_blocking(move || inst.plugin().flush(batch)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("flusher '{name}' failed to flush: {e:#}"),
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                log::error!(
                    "PLUGIN_RUNTIME_ALARM: flusher '{name}' panicked: {}",
                    payload_str(payload.as_ref())
                );
            }
            Err(_) => {}
        }
    }
}
