//! The unit of data that flows through a pipeline.

use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// A single collected record: a timestamp and ordered key/value fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub time: SystemTime,
    pub fields: Vec<(String, String)>,
}

impl LogEvent {
    /// Creates an empty event timestamped now.
    pub fn now() -> Self {
        Self {
            time: SystemTime::now(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Returns the value of the first field named `key`.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// A group of events flushed together, tagged with its pipeline of origin.
#[derive(Debug, Clone)]
pub struct LogBatch {
    pub project: String,
    pub logstore: String,
    pub events: Vec<LogEvent>,
}

/// Hand-off point between input plugins and the processing stage.
///
/// Inputs must never block on a slow pipeline: when the stage channel is
/// full, the event is dropped and a warning is emitted.
#[derive(Clone)]
pub struct Collector {
    tx: mpsc::Sender<LogEvent>,
    origin: String,
}

impl Collector {
    pub(crate) fn new(tx: mpsc::Sender<LogEvent>, origin: impl Into<String>) -> Self {
        Self {
            tx,
            origin: origin.into(),
        }
    }

    /// Hands an event to the processing stage.
    pub fn add(&self, event: LogEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "the input queue of {} is full, dropping an event; consider increasing queue_size",
                    self.origin
                );
            }
            Err(TrySendError::Closed(_)) => {
                // The pipeline is shutting down, late events are expected.
                log::debug!("the processing stage of {} is gone, dropping an event", self.origin);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LogEvent;

    #[test]
    fn field_lookup_returns_the_first_match() {
        let event = LogEvent::now()
            .with_field("metric", "uptime")
            .with_field("value", "1")
            .with_field("value", "2");
        assert_eq!(event.field("metric"), Some("uptime"));
        assert_eq!(event.field("value"), Some("1"));
        assert_eq!(event.field("missing"), None);
    }
}
