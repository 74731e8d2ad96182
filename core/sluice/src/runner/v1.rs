//! Generation-1 runner: staged queues with an ordered drain on stop.
//!
//! Events travel input -> processing -> aggregation -> flush, each stage on
//! its own control. Stopping cancels the stages upstream-first so that every
//! buffered event still reaches the flushers.

use std::sync::{Arc, Mutex};

use tokio::runtime;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::context::RuntimeContext;
use crate::control::AsyncControl;
use crate::event::{Collector, LogBatch, LogEvent};
use crate::pipeline::Pipeline;
use crate::plugin::{Aggregator, Flusher, MetricInput, PluginInstance, PluginKind, Processor, ServiceInput};

use super::{PluginRunner, RunnerParams, apply_processors, flush_batch, spawn_metric_loop, spawn_service};

pub(crate) struct V1Runner {
    tags: RuntimeContext,
    rt: runtime::Handle,
    params: RunnerParams,

    metric_plugins: Vec<Arc<PluginInstance<dyn MetricInput>>>,
    service_plugins: Vec<Arc<PluginInstance<dyn ServiceInput>>>,
    processor_plugins: Vec<Arc<PluginInstance<dyn Processor>>>,
    aggregator_plugins: Vec<Arc<PluginInstance<dyn Aggregator>>>,
    flusher_plugins: Vec<Arc<PluginInstance<dyn Flusher>>>,

    pipeline: Mutex<Option<Arc<Pipeline>>>,

    input_control: AsyncControl,
    process_control: AsyncControl,
    aggregate_control: AsyncControl,
    flush_control: AsyncControl,

    events_tx: Mutex<Option<mpsc::Sender<LogEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<LogEvent>>>,
    batches_tx: Mutex<Option<mpsc::Sender<LogBatch>>>,
    batches_rx: Mutex<Option<mpsc::Receiver<LogBatch>>>,
}

impl V1Runner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tags: RuntimeContext,
        rt: runtime::Handle,
        params: RunnerParams,
        metric_plugins: Vec<Arc<PluginInstance<dyn MetricInput>>>,
        service_plugins: Vec<Arc<PluginInstance<dyn ServiceInput>>>,
        processor_plugins: Vec<Arc<PluginInstance<dyn Processor>>>,
        aggregator_plugins: Vec<Arc<PluginInstance<dyn Aggregator>>>,
        flusher_plugins: Vec<Arc<PluginInstance<dyn Flusher>>>,
    ) -> Self {
        Self {
            tags,
            input_control: AsyncControl::new(rt.clone()),
            process_control: AsyncControl::new(rt.clone()),
            aggregate_control: AsyncControl::new(rt.clone()),
            flush_control: AsyncControl::new(rt.clone()),
            rt,
            params,
            metric_plugins,
            service_plugins,
            processor_plugins,
            aggregator_plugins,
            flusher_plugins,
            pipeline: Mutex::new(None),
            events_tx: Mutex::new(None),
            events_rx: Mutex::new(None),
            batches_tx: Mutex::new(None),
            batches_rx: Mutex::new(None),
        }
    }

    pub(crate) fn attach_pipeline(&self, pipeline: &Arc<Pipeline>) {
        for inst in &self.metric_plugins {
            inst.attach(Arc::clone(pipeline));
        }
        for inst in &self.service_plugins {
            inst.attach(Arc::clone(pipeline));
        }
        for inst in &self.processor_plugins {
            inst.attach(Arc::clone(pipeline));
        }
        for inst in &self.aggregator_plugins {
            inst.attach(Arc::clone(pipeline));
        }
        for inst in &self.flusher_plugins {
            inst.attach(Arc::clone(pipeline));
        }
        *self.pipeline.lock().unwrap() = Some(Arc::clone(pipeline));
    }
}

impl PluginRunner for V1Runner {
    fn is_with_input_plugin(&self) -> bool {
        !self.metric_plugins.is_empty() || !self.service_plugins.is_empty()
    }

    fn run(&self) {
        let (events_tx, events_rx) = mpsc::channel(self.params.queue_size.max(1));
        let (batches_tx, batches_rx) = mpsc::channel(self.params.queue_size.max(1));
        *self.events_tx.lock().unwrap() = Some(events_tx);
        *self.events_rx.lock().unwrap() = Some(events_rx);
        *self.batches_tx.lock().unwrap() = Some(batches_tx);
        *self.batches_rx.lock().unwrap() = Some(batches_rx);

        self.run_plugins(PluginKind::Flusher, &self.flush_control);
        self.run_plugins(PluginKind::Aggregator, &self.aggregate_control);
        self.run_plugins(PluginKind::Processor, &self.process_control);
        self.run_plugins(PluginKind::MetricInput, &self.input_control);
        self.run_plugins(PluginKind::ServiceInput, &self.input_control);
    }

    fn run_plugins(&self, kind: PluginKind, control: &AsyncControl) {
        match kind {
            PluginKind::MetricInput => {
                let Some(tx) = self.events_tx.lock().unwrap().clone() else {
                    log::warn!("{}: the input stage is not running", self.tags);
                    return;
                };
                for inst in &self.metric_plugins {
                    let collector = Collector::new(tx.clone(), self.tags.config_name.clone());
                    spawn_metric_loop(control, Arc::clone(inst), collector, self.params.input_interval);
                }
            }
            PluginKind::ServiceInput => {
                let Some(tx) = self.events_tx.lock().unwrap().clone() else {
                    log::warn!("{}: the input stage is not running", self.tags);
                    return;
                };
                for inst in &self.service_plugins {
                    let collector = Collector::new(tx.clone(), self.tags.config_name.clone());
                    spawn_service(control, Arc::clone(inst), collector);
                }
            }
            PluginKind::Processor => {
                let Some(mut rx) = self.events_rx.lock().unwrap().take() else {
                    return;
                };
                let processors = self.processor_plugins.clone();
                let aggregators = self.aggregator_plugins.clone();
                control.spawn(async move {
                    // Exits when every sender (inputs and the runner's own
                    // copy) is gone, so buffered events are always drained.
                    while let Some(event) = rx.recv().await {
                        let events = apply_processors(&processors, vec![event]);
                        for event in events {
                            for agg in &aggregators {
                                agg.plugin().add(event.clone());
                            }
                        }
                    }
                });
            }
            PluginKind::Aggregator => {
                let Some(batches_tx) = self.batches_tx.lock().unwrap().take() else {
                    return;
                };
                let aggregators = self.aggregator_plugins.clone();
                let token = control.token();
                let flush_interval = self.params.flush_interval;
                control.spawn(async move {
                    let mut ticks = tokio::time::interval(flush_interval);
                    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    ticks.tick().await; // the immediate first tick
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = ticks.tick() => {
                                if !send_ready_batches(&aggregators, &batches_tx).await {
                                    return;
                                }
                            }
                        }
                    }
                    // Final drain; the upstream stages have been joined by
                    // the time this control is cancelled.
                    send_ready_batches(&aggregators, &batches_tx).await;
                });
            }
            PluginKind::Flusher => {
                let Some(mut rx) = self.batches_rx.lock().unwrap().take() else {
                    return;
                };
                let flushers = self.flusher_plugins.clone();
                control.spawn(async move {
                    while let Some(batch) = rx.recv().await {
                        flush_batch(&flushers, &batch).await;
                    }
                });
            }
        }
    }

    fn stop(&self, removed: bool) -> anyhow::Result<()> {
        log::info!("stopping pipeline {} (removed = {removed})", self.tags);
        for inst in &self.service_plugins {
            if let Err(e) = inst.plugin().stop() {
                log::error!("service input '{}' of {} failed to stop: {e:#}", inst.name(), self.tags);
            }
        }
        self.rt.block_on(async {
            self.input_control.cancel_and_wait().await;
            // No senders left after this point: the processing stage drains
            // its queue and exits on its own.
            self.events_tx.lock().unwrap().take();
            self.process_control.cancel_and_wait().await;
            self.aggregate_control.cancel_and_wait().await;
            self.flush_control.cancel_and_wait().await;
        });
        for inst in &self.flusher_plugins {
            if let Err(e) = inst.plugin().stop() {
                log::error!("flusher '{}' of {} failed to stop: {e:#}", inst.name(), self.tags);
            }
        }
        log::info!("pipeline {} stopped", self.tags);
        Ok(())
    }

    fn detach(&self) {
        for inst in &self.metric_plugins {
            inst.detach();
        }
        for inst in &self.service_plugins {
            inst.detach();
        }
        for inst in &self.processor_plugins {
            inst.detach();
        }
        for inst in &self.aggregator_plugins {
            inst.detach();
        }
        for inst in &self.flusher_plugins {
            inst.detach();
        }
        self.pipeline.lock().unwrap().take();
    }

    fn detached(&self) -> bool {
        self.pipeline.lock().unwrap().is_none()
            && self.metric_plugins.iter().all(|i| i.pipeline().is_none())
            && self.service_plugins.iter().all(|i| i.pipeline().is_none())
            && self.processor_plugins.iter().all(|i| i.pipeline().is_none())
            && self.aggregator_plugins.iter().all(|i| i.pipeline().is_none())
            && self.flusher_plugins.iter().all(|i| i.pipeline().is_none())
    }

    fn buffered_events(&self) -> usize {
        self.aggregator_plugins.iter().map(|agg| agg.plugin().pending()).sum()
    }
}

async fn send_ready_batches(
    aggregators: &[Arc<PluginInstance<dyn Aggregator>>],
    tx: &mpsc::Sender<LogBatch>,
) -> bool {
    for agg in aggregators {
        for batch in agg.plugin().take() {
            if tx.send(batch).await.is_err() {
                // The flush stage is gone, there is nowhere left to send.
                return false;
            }
        }
    }
    true
}
