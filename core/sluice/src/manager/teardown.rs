//! Breaking a pipeline's object graph so it can be reclaimed.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::pipeline::Pipeline;
use crate::runner::PluginRunner;

use super::PipelineManager;

/// Clears every back-reference between a pipeline, its context, its runner
/// and its plugin instances.
///
/// If `removed` is false the pipeline was disabled rather than deleted, and
/// its runner is retained in the last-unsent map so data that never reached
/// a flusher can still be inspected.
///
/// Idempotent: on an already-torn-down pipeline every step is a no-op.
pub(crate) fn tear_down(
    last_unsent: &Mutex<FxHashMap<String, Arc<dyn PluginRunner>>>,
    pipeline: &Arc<Pipeline>,
    removed: bool,
) {
    if let Some(ctx) = pipeline.take_context() {
        ctx.detach();
    }
    if let Some(runner) = pipeline.take_runner() {
        runner.detach();
        if !removed {
            last_unsent
                .lock()
                .unwrap()
                .insert(pipeline.name().to_owned(), runner);
        }
    }
}

impl PipelineManager {
    pub(crate) fn tear_down(&self, pipeline: &Arc<Pipeline>, removed: bool) {
        tear_down(&self.last_unsent, pipeline, removed);
    }
}

#[cfg(test)]
mod tests {
    use super::tear_down;
    use crate::pipeline::PipelineBuilder;
    use std::sync::Mutex;

    #[test]
    fn tear_down_is_idempotent() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pipeline = PipelineBuilder::new("cfg", "proj", "store", rt.handle().clone())
            .build()
            .unwrap();
        let runner = pipeline.runner().unwrap();
        let ctx = pipeline.context().unwrap();
        let last_unsent = Mutex::new(Default::default());

        tear_down(&last_unsent, &pipeline, true);
        assert!(pipeline.runner().is_none());
        assert!(pipeline.context().is_none());
        assert!(runner.detached());
        assert!(ctx.pipeline().is_none());
        assert!(last_unsent.lock().unwrap().is_empty());

        // second call: everything is already nil, nothing changes
        tear_down(&last_unsent, &pipeline, true);
        assert!(runner.detached());
    }

    #[test]
    fn disabled_pipelines_keep_their_runner_for_inspection() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pipeline = PipelineBuilder::new("cfg", "proj", "store", rt.handle().clone())
            .build()
            .unwrap();
        let last_unsent = Mutex::new(Default::default());

        tear_down(&last_unsent, &pipeline, false);
        let retained = last_unsent.lock().unwrap();
        assert!(retained.contains_key("cfg"));
    }
}
