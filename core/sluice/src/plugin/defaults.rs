//! Default processing-stage plugins, attached when a pipeline configures none.

use std::sync::Mutex;

use crate::event::{LogBatch, LogEvent};
use crate::plugin::{Aggregator, Flusher};

/// Accumulates events and cuts one batch per flush round.
pub struct BaseAggregator {
    project: String,
    logstore: String,
    buf: Mutex<Vec<LogEvent>>,
}

impl BaseAggregator {
    pub fn new(project: impl Into<String>, logstore: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            logstore: logstore.into(),
            buf: Mutex::new(Vec::new()),
        }
    }
}

impl Aggregator for BaseAggregator {
    fn add(&self, event: LogEvent) {
        self.buf.lock().unwrap().push(event);
    }

    fn take(&self) -> Vec<LogBatch> {
        let events = std::mem::take(&mut *self.buf.lock().unwrap());
        if events.is_empty() {
            return Vec::new();
        }
        vec![LogBatch {
            project: self.project.clone(),
            logstore: self.logstore.clone(),
            events,
        }]
    }

    fn pending(&self) -> usize {
        self.buf.lock().unwrap().len()
    }
}

/// Writes batches to the agent log.
///
/// The builtin pipelines report through the agent's own output rather than a
/// remote backend.
pub struct LogFlusher;

impl Flusher for LogFlusher {
    fn flush(&self, batch: LogBatch) -> anyhow::Result<()> {
        log::info!(
            "{}/{}: flushed {} events",
            batch.project,
            batch.logstore,
            batch.events.len()
        );
        for event in &batch.events {
            log::debug!("{}/{}: {:?}", batch.project, batch.logstore, event.fields);
        }
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::BaseAggregator;
    use crate::event::LogEvent;
    use crate::plugin::Aggregator;

    #[test]
    fn take_drains_the_buffer() {
        let agg = BaseAggregator::new("proj", "store");
        agg.add(LogEvent::now().with_field("a", "1"));
        agg.add(LogEvent::now().with_field("b", "2"));
        assert_eq!(agg.pending(), 2);

        let batches = agg.take();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].events.len(), 2);
        assert_eq!(batches[0].project, "proj");
        assert_eq!(agg.pending(), 0);
        assert!(agg.take().is_empty());
    }
}
