//! Deadline-bound stop: racing a pipeline's stop procedure against the clock.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::oneshot;

use crate::pipeline::Pipeline;
use crate::util::panic::payload_str;

use super::{PipelineManager, teardown};

impl PipelineManager {
    /// Runs `pipeline.stop(removed)` on a dedicated thread and waits for it,
    /// at most `stop_timeout`.
    ///
    /// Returns true if the stop finished in time. On timeout the caller gets
    /// control back immediately and the pipeline is quarantined in the
    /// disabled set; nothing interrupts the stop thread (plugins offer no
    /// preemption point), it keeps running and performs the deferred
    /// teardown when it eventually finishes.
    pub(crate) async fn timeout_stop(&self, pipeline: Arc<Pipeline>, removed: bool) -> bool {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        // Written and read under the disabled-set lock, so the thread and the
        // timed-out caller agree on who performs the teardown.
        let finished = Arc::new(AtomicBool::new(false));
        {
            let pipeline = Arc::clone(&pipeline);
            let finished = Arc::clone(&finished);
            let disabled = Arc::clone(&self.disabled);
            let last_unsent = Arc::clone(&self.last_unsent);
            std::thread::spawn(move || {
                let name = pipeline.name_with_suffix().to_owned();
                log::info!("stop of pipeline {name} running in a background thread");
                match panic::catch_unwind(AssertUnwindSafe(|| pipeline.stop(removed))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::error!("stop of pipeline {name} returned an error: {e:#}"),
                    Err(payload) => log::error!(
                        "PLUGIN_RUNTIME_ALARM: stop of pipeline {name} panicked: {}",
                        payload_str(payload.as_ref())
                    ),
                }
                let _ = done_tx.send(());
                let mut disabled = disabled.lock().unwrap();
                finished.store(true, Ordering::SeqCst);
                if disabled.remove(&pipeline.id()) {
                    // The pipeline was valid but slow: the caller gave up on
                    // it long ago, finish the deferred teardown here.
                    log::info!("slow pipeline {name} finally stopped, completing its teardown");
                    teardown::tear_down(&last_unsent, &pipeline, removed);
                }
            });
        }
        match tokio::time::timeout(self.config.stop_timeout, done_rx).await {
            Ok(_) => true,
            Err(_elapsed) => {
                let mut disabled = self.disabled.lock().unwrap();
                if finished.load(Ordering::SeqCst) {
                    // The stop finished in the same instant the deadline
                    // fired, after the thread ran its own disabled-set check.
                    // Report completion so the caller tears down normally.
                    true
                } else {
                    disabled.insert(pipeline.id());
                    false
                }
            }
        }
    }
}
