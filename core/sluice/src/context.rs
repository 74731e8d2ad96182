//! Per-pipeline execution context.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::runtime;

use crate::pipeline::Pipeline;

/// Identification tags of a pipeline, used in log records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    pub project: String,
    pub logstore: String,
    pub config_name: String,
}

impl fmt::Display for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.logstore, self.config_name)
    }
}

/// Execution context owned by a pipeline: its identification tags, the
/// runtime handle its plugin tasks are spawned on, and a back-reference to
/// the pipeline itself.
///
/// The back-reference closes a cycle in the object graph; teardown clears it
/// so a stopped pipeline can be reclaimed.
pub struct PipelineContext {
    tags: RuntimeContext,
    rt: runtime::Handle,
    pipeline: Mutex<Option<Arc<Pipeline>>>,
}

impl PipelineContext {
    pub(crate) fn new(tags: RuntimeContext, rt: runtime::Handle) -> Self {
        Self {
            tags,
            rt,
            pipeline: Mutex::new(None),
        }
    }

    pub fn runtime_context(&self) -> RuntimeContext {
        self.tags.clone()
    }

    pub fn runtime(&self) -> &runtime::Handle {
        &self.rt
    }

    /// The owning pipeline, if the context has not been torn down yet.
    pub fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.pipeline.lock().unwrap().clone()
    }

    pub(crate) fn attach(&self, pipeline: Arc<Pipeline>) {
        *self.pipeline.lock().unwrap() = Some(pipeline);
    }

    pub(crate) fn detach(&self) {
        self.pipeline.lock().unwrap().take();
    }
}
