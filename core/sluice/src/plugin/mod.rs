//! Plugin roles and instances.
//!
//! Plugins are synchronous objects; the runner drives them from async tasks
//! and moves potentially blocking calls to the blocking pool.

pub mod defaults;
pub mod selfmetrics;

use std::sync::{Arc, Mutex};

use crate::context::PipelineContext;
use crate::event::{Collector, LogBatch, LogEvent};
use crate::pipeline::Pipeline;

/// The five plugin roles of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    MetricInput,
    ServiceInput,
    Processor,
    Aggregator,
    Flusher,
}

/// A polled input: collects one round of events when triggered.
pub trait MetricInput: Send + Sync {
    fn collect(&self, collector: &Collector) -> anyhow::Result<()>;
}

/// A long-running input: `start` blocks until `stop` is called.
pub trait ServiceInput: Send + Sync {
    fn start(&self, collector: Collector) -> anyhow::Result<()>;
    fn stop(&self) -> anyhow::Result<()>;
}

/// Transforms a batch of events on the processing stage.
pub trait Processor: Send + Sync {
    fn process(&self, events: Vec<LogEvent>) -> Vec<LogEvent>;
}

/// Accumulates events into flushable batches.
pub trait Aggregator: Send + Sync {
    fn add(&self, event: LogEvent);
    /// Takes every complete batch out of the aggregator.
    fn take(&self) -> Vec<LogBatch>;
    /// Number of events accumulated but not yet taken.
    fn pending(&self) -> usize;
}

/// Sends batches out of the agent.
pub trait Flusher: Send + Sync {
    fn flush(&self, batch: LogBatch) -> anyhow::Result<()>;
    fn stop(&self) -> anyhow::Result<()>;
}

/// A plugin of role `P` bound to its owning pipeline.
///
/// The back-reference is what a plugin uses to look up its execution context
/// while running; teardown clears it so the pipeline graph can be reclaimed.
pub struct PluginInstance<P: ?Sized> {
    name: String,
    plugin: Box<P>,
    pipeline: Mutex<Option<Arc<Pipeline>>>,
}

impl<P: ?Sized> PluginInstance<P> {
    pub fn new(name: impl Into<String>, plugin: Box<P>) -> Self {
        Self {
            name: name.into(),
            plugin,
            pipeline: Mutex::new(None),
        }
    }

    /// The plugin type name, e.g. `metric_alarm`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin(&self) -> &P {
        &self.plugin
    }

    /// The owning pipeline, until teardown clears the back-reference.
    pub fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.pipeline.lock().unwrap().clone()
    }

    /// The owning pipeline's execution context, if still attached.
    pub fn context(&self) -> Option<Arc<PipelineContext>> {
        self.pipeline().and_then(|p| p.context())
    }

    pub(crate) fn attach(&self, pipeline: Arc<Pipeline>) {
        *self.pipeline.lock().unwrap() = Some(pipeline);
    }

    pub(crate) fn detach(&self) {
        self.pipeline.lock().unwrap().take();
    }
}
