//! The unit of lifecycle: a named chain of plugins under one configuration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context;
use tokio::runtime;

use crate::context::{PipelineContext, RuntimeContext};
use crate::plugin::defaults::{BaseAggregator, LogFlusher};
use crate::plugin::{Aggregator, Flusher, MetricInput, PluginInstance, Processor, ServiceInput};
use crate::runner::v1::V1Runner;
use crate::runner::v2::V2Runner;
use crate::runner::{PluginRunner, RunnerParams};

/// Process-unique identity of a pipeline object.
///
/// Reload generations of the same configuration name get distinct ids, so
/// identity-keyed bookkeeping (the disabled set) can never conflate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(u64);

impl PipelineId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// One runnable chain of input/processor/aggregator/flusher plugins under a
/// single configuration name.
///
/// A pipeline is mutated only through its owning manager. External code
/// reaches the plugins through the [`PluginRunner`] capability interface and
/// nothing else.
pub struct Pipeline {
    id: PipelineId,
    name: String,
    name_with_suffix: String,
    context: Mutex<Option<Arc<PipelineContext>>>,
    runner: RwLock<Option<Arc<dyn PluginRunner>>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("name_with_suffix", &self.name_with_suffix)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn id(&self) -> PipelineId {
        self.id
    }

    /// The base configuration name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration name disambiguated by its reload generation.
    pub fn name_with_suffix(&self) -> &str {
        &self.name_with_suffix
    }

    /// The execution context, until teardown clears it.
    pub fn context(&self) -> Option<Arc<PipelineContext>> {
        self.context.lock().unwrap().clone()
    }

    /// The plugin runner, until teardown clears it.
    pub fn runner(&self) -> Option<Arc<dyn PluginRunner>> {
        self.runner.read().unwrap().clone()
    }

    pub fn runtime_context(&self) -> Option<RuntimeContext> {
        self.context().map(|ctx| ctx.runtime_context())
    }

    /// Whether this pipeline owns an input stage.
    pub fn is_with_input(&self) -> bool {
        self.runner().map(|r| r.is_with_input_plugin()).unwrap_or(false)
    }

    /// Starts every plugin stage.
    pub fn start(&self) -> anyhow::Result<()> {
        let runner = self.runner().context("pipeline has been torn down")?;
        runner.run();
        Ok(())
    }

    /// Stops the pipeline, draining buffered data to the flushers.
    ///
    /// Blocking: hangs for as long as a plugin's stop hangs. Must not be
    /// called from an async context; the manager runs it on a dedicated
    /// thread and races it against the stop deadline.
    pub fn stop(&self, removed: bool) -> anyhow::Result<()> {
        match self.runner() {
            Some(runner) => runner.stop(removed),
            // Already torn down, nothing left to stop.
            None => Ok(()),
        }
    }

    pub(crate) fn take_context(&self) -> Option<Arc<PipelineContext>> {
        self.context.lock().unwrap().take()
    }

    pub(crate) fn take_runner(&self) -> Option<Arc<dyn PluginRunner>> {
        self.runner.write().unwrap().take()
    }
}

/// Which runner generation executes the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunnerGeneration {
    #[default]
    V1,
    V2,
}

/// Assembles a [`Pipeline`] and wires its object graph.
///
/// This is the hand-off point for the config loader: build the pipeline
/// here, then place it into a staging slot with
/// [`PipelineManager::stage`](crate::manager::PipelineManager::stage).
pub struct PipelineBuilder {
    name: String,
    suffix: Option<String>,
    project: String,
    logstore: String,
    rt: runtime::Handle,
    generation: RunnerGeneration,
    params: RunnerParams,
    metric: Vec<(String, Box<dyn MetricInput>)>,
    service: Vec<(String, Box<dyn ServiceInput>)>,
    processors: Vec<(String, Box<dyn Processor>)>,
    aggregators: Vec<(String, Box<dyn Aggregator>)>,
    flushers: Vec<(String, Box<dyn Flusher>)>,
}

impl PipelineBuilder {
    pub fn new(
        name: impl Into<String>,
        project: impl Into<String>,
        logstore: impl Into<String>,
        rt: runtime::Handle,
    ) -> Self {
        Self {
            name: name.into(),
            suffix: None,
            project: project.into(),
            logstore: logstore.into(),
            rt,
            generation: RunnerGeneration::default(),
            params: RunnerParams::default(),
            metric: Vec::new(),
            service: Vec::new(),
            processors: Vec::new(),
            aggregators: Vec::new(),
            flushers: Vec::new(),
        }
    }

    /// Disambiguates reload generations of the same logical configuration.
    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn generation(mut self, generation: RunnerGeneration) -> Self {
        self.generation = generation;
        self
    }

    pub fn params(mut self, params: RunnerParams) -> Self {
        self.params = params;
        self
    }

    pub fn metric_input(mut self, name: impl Into<String>, plugin: Box<dyn MetricInput>) -> Self {
        self.metric.push((name.into(), plugin));
        self
    }

    pub fn service_input(mut self, name: impl Into<String>, plugin: Box<dyn ServiceInput>) -> Self {
        self.service.push((name.into(), plugin));
        self
    }

    pub fn processor(mut self, name: impl Into<String>, plugin: Box<dyn Processor>) -> Self {
        self.processors.push((name.into(), plugin));
        self
    }

    pub fn aggregator(mut self, name: impl Into<String>, plugin: Box<dyn Aggregator>) -> Self {
        self.aggregators.push((name.into(), plugin));
        self
    }

    pub fn flusher(mut self, name: impl Into<String>, plugin: Box<dyn Flusher>) -> Self {
        self.flushers.push((name.into(), plugin));
        self
    }

    /// Builds the pipeline and wires every back-reference.
    ///
    /// A pipeline without an explicit aggregator or flusher gets the default
    /// ones, so that collected events always have somewhere to go.
    pub fn build(self) -> anyhow::Result<Arc<Pipeline>> {
        anyhow::ensure!(!self.name.is_empty(), "pipeline name must not be empty");
        anyhow::ensure!(
            !self.params.input_interval.is_zero() && !self.params.flush_interval.is_zero(),
            "pipeline intervals must be positive"
        );

        let name_with_suffix = match &self.suffix {
            Some(suffix) => format!("{}/{}", self.name, suffix),
            None => self.name.clone(),
        };
        let tags = RuntimeContext {
            project: self.project,
            logstore: self.logstore,
            config_name: name_with_suffix.clone(),
        };

        let metric: Vec<Arc<PluginInstance<dyn MetricInput>>> = self
            .metric
            .into_iter()
            .map(|(name, plugin)| Arc::new(PluginInstance::new(name, plugin)))
            .collect();
        let service: Vec<Arc<PluginInstance<dyn ServiceInput>>> = self
            .service
            .into_iter()
            .map(|(name, plugin)| Arc::new(PluginInstance::new(name, plugin)))
            .collect();
        let processors: Vec<Arc<PluginInstance<dyn Processor>>> = self
            .processors
            .into_iter()
            .map(|(name, plugin)| Arc::new(PluginInstance::new(name, plugin)))
            .collect();
        let mut aggregators: Vec<Arc<PluginInstance<dyn Aggregator>>> = self
            .aggregators
            .into_iter()
            .map(|(name, plugin)| Arc::new(PluginInstance::new(name, plugin)))
            .collect();
        if aggregators.is_empty() {
            let base = BaseAggregator::new(tags.project.clone(), tags.logstore.clone());
            aggregators.push(Arc::new(PluginInstance::new("aggregator_base", Box::new(base) as Box<dyn Aggregator>)));
        }
        let mut flushers: Vec<Arc<PluginInstance<dyn Flusher>>> = self
            .flushers
            .into_iter()
            .map(|(name, plugin)| Arc::new(PluginInstance::new(name, plugin)))
            .collect();
        if flushers.is_empty() {
            flushers.push(Arc::new(PluginInstance::new(
                "flusher_log",
                Box::new(LogFlusher) as Box<dyn Flusher>,
            )));
        }

        let ctx = Arc::new(PipelineContext::new(tags.clone(), self.rt.clone()));
        let pipeline = match self.generation {
            RunnerGeneration::V1 => {
                let runner = Arc::new(V1Runner::new(
                    tags,
                    self.rt,
                    self.params,
                    metric,
                    service,
                    processors,
                    aggregators,
                    flushers,
                ));
                let pipeline = Arc::new(Pipeline {
                    id: PipelineId::next(),
                    name: self.name,
                    name_with_suffix,
                    context: Mutex::new(Some(Arc::clone(&ctx))),
                    runner: RwLock::new(Some(Arc::clone(&runner) as Arc<dyn PluginRunner>)),
                });
                runner.attach_pipeline(&pipeline);
                pipeline
            }
            RunnerGeneration::V2 => {
                let runner = Arc::new(V2Runner::new(
                    tags,
                    self.rt,
                    self.params,
                    metric,
                    service,
                    processors,
                    aggregators,
                    flushers,
                ));
                let pipeline = Arc::new(Pipeline {
                    id: PipelineId::next(),
                    name: self.name,
                    name_with_suffix,
                    context: Mutex::new(Some(Arc::clone(&ctx))),
                    runner: RwLock::new(Some(Arc::clone(&runner) as Arc<dyn PluginRunner>)),
                });
                runner.attach_pipeline(&pipeline);
                pipeline
            }
        };
        ctx.attach(Arc::clone(&pipeline));
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::{PipelineBuilder, RunnerGeneration};
    use crate::event::Collector;
    use crate::plugin::MetricInput;
    use std::sync::Arc;

    struct NullInput;

    impl MetricInput for NullInput {
        fn collect(&self, _collector: &Collector) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn build_wires_the_object_graph() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pipeline = PipelineBuilder::new("cfg", "proj", "store", rt.handle().clone())
            .suffix("1")
            .metric_input("null", Box::new(NullInput))
            .build()
            .unwrap();

        assert_eq!(pipeline.name(), "cfg");
        assert_eq!(pipeline.name_with_suffix(), "cfg/1");
        assert!(pipeline.is_with_input());

        // the context points back at the pipeline
        let ctx = pipeline.context().unwrap();
        assert!(Arc::ptr_eq(&ctx.pipeline().unwrap(), &pipeline));

        // the runner is attached and not yet detached
        let runner = pipeline.runner().unwrap();
        assert!(!runner.detached());
    }

    #[test]
    fn pipelines_without_inputs_report_no_input_stage() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pipeline = PipelineBuilder::new("cfg", "proj", "store", rt.handle().clone())
            .generation(RunnerGeneration::V2)
            .build()
            .unwrap();
        assert!(!pipeline.is_with_input());
    }

    #[test]
    fn reload_generations_have_distinct_identities() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let a = PipelineBuilder::new("cfg", "proj", "store", rt.handle().clone())
            .suffix("1")
            .build()
            .unwrap();
        let b = PipelineBuilder::new("cfg", "proj", "store", rt.handle().clone())
            .suffix("2")
            .build()
            .unwrap();
        assert_ne!(a.id(), b.id());
    }
}
