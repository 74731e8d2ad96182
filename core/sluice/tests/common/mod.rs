//! Test plugins shared by the lifecycle tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use sluice::event::{Collector, LogBatch, LogEvent};
use sluice::plugin::{Flusher, MetricInput, ServiceInput};

/// Counts collection rounds and emits one event per round.
#[derive(Default)]
pub struct CountingInput {
    pub rounds: Arc<AtomicU64>,
}

impl MetricInput for CountingInput {
    fn collect(&self, collector: &Collector) -> anyhow::Result<()> {
        let round = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
        collector.add(LogEvent::now().with_field("round", round.to_string()));
        Ok(())
    }
}

/// Captures every flushed batch for later assertions.
#[derive(Clone, Default)]
pub struct MemoryFlusher {
    pub batches: Arc<Mutex<Vec<LogBatch>>>,
}

impl Flusher for MemoryFlusher {
    fn flush(&self, batch: LogBatch) -> anyhow::Result<()> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Blocks callers of [`Gate::wait`] until the test releases it.
#[derive(Default)]
pub struct Gate {
    released: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut released = self.released.lock().unwrap();
        while !*released {
            released = self.cond.wait(released).unwrap();
        }
    }
}

/// A service input whose stop blocks until the test opens the gate,
/// simulating a plugin stuck in a hanging network write.
pub struct SlowStopService {
    stopped: AtomicBool,
    gate: Arc<Gate>,
}

impl SlowStopService {
    pub fn new(gate: Arc<Gate>) -> Self {
        Self {
            stopped: AtomicBool::new(false),
            gate,
        }
    }
}

impl ServiceInput for SlowStopService {
    fn start(&self, _collector: Collector) -> anyhow::Result<()> {
        while !self.stopped.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.gate.wait();
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A service input whose stop panics.
pub struct PanickyStopService;

impl ServiceInput for PanickyStopService {
    fn start(&self, _collector: Collector) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        panic!("stop exploded")
    }
}
