//! The lifecycle manager: registry, staging slots, and the stop protocol.

mod stop;
mod teardown;

use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::runtime;

use crate::builtin::BuiltinPipelines;
use crate::checkpoint::CheckpointManager;
use crate::config::AgentConfig;
use crate::context::RuntimeContext;
use crate::error::ManagerError;
use crate::pipeline::{Pipeline, PipelineId};
use crate::runner::PluginRunner;
use crate::util::panic::{guard, guard_async};

/// Owns every running pipeline of the agent and serializes their lifecycle.
///
/// One manager instance is constructed at process start and passed to every
/// call site; there are no process-wide singletons. The correctness goal is
/// agent-level liveness: a misbehaving pipeline is quarantined or contained,
/// never allowed to stall the reload/shutdown path.
pub struct PipelineManager {
    config: AgentConfig,
    rt: runtime::Handle,

    /// Active pipelines, keyed by name-with-suffix.
    registry: RwLock<FxHashMap<String, Arc<Pipeline>>>,

    /// Freshly-built pipelines awaiting promotion by [`start`](Self::start).
    staging: Mutex<Staging>,

    /// Pipelines whose stop exceeded the deadline; shared with the background
    /// stop threads that reconcile it. Locked independently of the registry.
    disabled: Arc<Mutex<FxHashSet<PipelineId>>>,

    /// Runners of pipelines that were disabled (not deleted), kept so their
    /// unflushed data can still be inspected.
    last_unsent: Arc<Mutex<FxHashMap<String, Arc<dyn PluginRunner>>>>,

    builtins: Mutex<Option<BuiltinPipelines>>,
    checkpoints: CheckpointManager,
}

/// One config reload may need both slots at once, e.g. container metadata
/// (with input) plus static file tailing (without input).
#[derive(Default)]
struct Staging {
    with_input: Option<Arc<Pipeline>>,
    without_input: Option<Arc<Pipeline>>,
}

impl PipelineManager {
    pub fn new(config: AgentConfig, rt: runtime::Handle) -> Self {
        let checkpoints = CheckpointManager::new(&config.checkpoint_dir);
        Self {
            config,
            rt,
            registry: RwLock::new(FxHashMap::default()),
            staging: Mutex::new(Staging::default()),
            disabled: Arc::new(Mutex::new(FxHashSet::default())),
            last_unsent: Arc::new(Mutex::new(FxHashMap::default())),
            builtins: Mutex::new(None),
            checkpoints,
        }
    }

    /// One-time bootstrap: checkpoint store, then the builtin pipelines.
    ///
    /// A failure here is fatal; the agent should abort its startup.
    pub fn init(&self) -> anyhow::Result<()> {
        log::info!("initializing the pipeline manager");
        self.checkpoints.init().context("checkpoint init failed")?;
        let builtins = BuiltinPipelines::load(&self.rt).inspect_err(|e| {
            log::error!("LOAD_PLUGIN_ALARM: failed to load the builtin pipelines: {e:#}");
        })?;
        *self.builtins.lock().unwrap() = Some(builtins);
        Ok(())
    }

    /// Places a freshly-built pipeline into the staging slot matching its
    /// input ownership, ready to be promoted by [`start`](Self::start).
    pub fn stage(&self, pipeline: Arc<Pipeline>) {
        let mut staging = self.staging.lock().unwrap();
        let slot = if pipeline.is_with_input() {
            &mut staging.with_input
        } else {
            &mut staging.without_input
        };
        if let Some(previous) = slot.replace(pipeline) {
            log::warn!(
                "staged pipeline {} was replaced before being started",
                previous.name_with_suffix()
            );
        }
    }

    /// Promotes the staged pipeline named `name` into the registry.
    ///
    /// The matching slot is consumed the instant its pipeline is taken. If
    /// `name` matches neither slot the loader and the manager are out of
    /// sync, which is surfaced as [`ManagerError::StagedMismatch`].
    pub fn start(&self, name: &str) -> Result<(), ManagerError> {
        guard("start pipeline", Ok(()), || self.start_inner(name))
    }

    fn start_inner(&self, name: &str) -> Result<(), ManagerError> {
        let staged = {
            let mut staging = self.staging.lock().unwrap();
            if staging.with_input.as_ref().is_some_and(|p| p.name_with_suffix() == name) {
                staging.with_input.take()
            } else if staging.without_input.as_ref().is_some_and(|p| p.name_with_suffix() == name) {
                staging.without_input.take()
            } else {
                let mut staged = String::new();
                if let Some(p) = &staging.with_input {
                    staged.push_str(p.name_with_suffix());
                }
                if let Some(p) = &staging.without_input {
                    if !staged.is_empty() {
                        staged.push(' ');
                    }
                    staged.push_str(p.name_with_suffix());
                }
                return Err(ManagerError::StagedMismatch {
                    given: name.to_owned(),
                    staged,
                });
            }
        };
        // The slot matched, promote the pipeline.
        let pipeline = staged.expect("matched staging slot cannot be empty");
        if let Err(e) = pipeline.start() {
            log::error!("failed to start pipeline {name}: {e:#}");
        } else {
            log::info!("pipeline {name} started");
        }
        self.registry
            .write()
            .unwrap()
            .insert(pipeline.name_with_suffix().to_owned(), pipeline);
        Ok(())
    }

    /// Stops and removes a registered pipeline, racing the stop deadline.
    ///
    /// A stop that exceeds the deadline is not a failure of this operation:
    /// the pipeline is quarantined, the name is removed from the registry
    /// either way, and the call reports success.
    pub async fn stop(&self, name: &str, removed: bool) -> Result<(), ManagerError> {
        guard_async("stop pipeline", Ok(()), self.stop_inner(name, removed)).await
    }

    async fn stop_inner(&self, name: &str, removed: bool) -> Result<(), ManagerError> {
        let pipeline = self
            .registry
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::PipelineNotFound { name: name.to_owned() })?;
        if self.timeout_stop(Arc::clone(&pipeline), removed).await {
            log::info!("pipeline {name} stopped in time");
            let mut registry = self.registry.write().unwrap();
            self.tear_down(&pipeline, removed);
            registry.remove(name);
        } else {
            log::error!("CONFIG_STOP_TIMEOUT_ALARM: timeout when stopping pipeline {name}, the stop task may leak");
            self.registry.write().unwrap().remove(name);
        }
        Ok(())
    }

    /// Stops every registered pipeline whose input ownership matches
    /// `with_input`, so that the agent is ready to quit.
    pub async fn stop_all_pipelines(&self, with_input: bool) -> Result<(), ManagerError> {
        guard_async("stop all pipelines", Ok(()), self.stop_all_inner(with_input)).await
    }

    async fn stop_all_inner(&self, with_input: bool) -> Result<(), ManagerError> {
        // Partition a snapshot; the stops themselves run without any registry
        // lock held, since each one can block for up to the deadline.
        let targets: Vec<(String, Arc<Pipeline>)> = {
            let registry = self.registry.write().unwrap();
            registry
                .iter()
                .filter(|(_, p)| p.is_with_input() == with_input)
                .map(|(name, p)| (name.clone(), Arc::clone(p)))
                .collect()
        };
        let mut stopped = Vec::with_capacity(targets.len());
        for (name, pipeline) in targets {
            log::info!("stopping pipeline {name}");
            if self.timeout_stop(Arc::clone(&pipeline), true).await {
                self.tear_down(&pipeline, true);
            } else {
                log::error!(
                    "CONFIG_STOP_TIMEOUT_ALARM: timeout when stopping pipeline {name}, the stop task may leak"
                );
            }
            stopped.push(name);
        }
        let mut registry = self.registry.write().unwrap();
        for name in stopped {
            registry.remove(&name);
        }
        Ok(())
    }

    /// Tears down and removes a registered pipeline without running its stop
    /// procedure. For pipelines that never started properly.
    pub fn remove(&self, name: &str, removed: bool) -> Result<(), ManagerError> {
        let mut registry = self.registry.write().unwrap();
        match registry.remove(name) {
            Some(pipeline) => {
                self.tear_down(&pipeline, removed);
                Ok(())
            }
            None => Err(ManagerError::PipelineNotFound { name: name.to_owned() }),
        }
    }

    /// Shuts down the builtin pipelines, then the checkpoint store.
    pub async fn stop_builtin_modules(&self) {
        let builtins = self.builtins.lock().unwrap().take();
        if let Some(builtins) = builtins {
            builtins.stop(self.config.force_self_collect).await;
        }
        self.checkpoints.stop();
    }

    /// Looks up a registered pipeline by name-with-suffix.
    pub fn pipeline(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.registry.read().unwrap().get(name).cloned()
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.registry.read().unwrap().keys().cloned().collect()
    }

    /// Read-only access to a pipeline's tags, for logging and diagnostics.
    pub fn runtime_context(&self, name: &str) -> Option<RuntimeContext> {
        self.registry
            .read()
            .unwrap()
            .get(name)
            .and_then(|p| p.runtime_context())
    }

    /// Number of pipelines quarantined by a stop timeout.
    pub fn disabled_count(&self) -> usize {
        self.disabled.lock().unwrap().len()
    }

    /// The retained runner of a pipeline that was disabled rather than
    /// deleted, holding the data that never reached a flusher.
    pub fn last_unsent_runner(&self, name: &str) -> Option<Arc<dyn PluginRunner>> {
        self.last_unsent.lock().unwrap().get(name).cloned()
    }

    pub fn builtins_loaded(&self) -> bool {
        self.builtins.lock().unwrap().is_some()
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }
}
