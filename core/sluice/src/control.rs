//! Cancellable groups of plugin tasks.

use std::sync::Mutex;

use tokio::runtime;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::util::panic::payload_str;

/// A group of tasks running the plugins of one pipeline stage.
///
/// Cancellation is cooperative: [`cancel_and_wait`](Self::cancel_and_wait)
/// requests a stop through the token, then joins every task of the group.
/// A task that ignores the token runs to completion and the join blocks,
/// which is exactly what the deadline-bound stop executor races against.
pub struct AsyncControl {
    rt: runtime::Handle,
    token: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl AsyncControl {
    pub fn new(rt: runtime::Handle) -> Self {
        Self {
            rt,
            token: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// The token observed by the tasks of this group.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawns an async task in the group.
    pub fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        self.tasks.lock().unwrap().spawn_on(task, &self.rt);
    }

    /// Spawns a blocking task in the group, on the runtime's blocking pool.
    pub fn spawn_blocking(&self, f: impl FnOnce() + Send + 'static) {
        self.tasks.lock().unwrap().spawn_blocking_on(f, &self.rt);
    }

    /// Cancels the group and waits for every task to finish.
    ///
    /// A panicked task is logged and does not unwind into the caller; the
    /// other tasks of the group are still joined.
    pub async fn cancel_and_wait(&self) {
        self.token.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    let payload = e.into_panic();
                    log::error!(
                        "PLUGIN_RUNTIME_ALARM: plugin task panicked: {}",
                        payload_str(payload.as_ref())
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AsyncControl;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn cancel_and_wait_joins_every_task() {
        let control = AsyncControl::new(tokio::runtime::Handle::current());
        let finished = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let token = control.token();
            let finished = Arc::clone(&finished);
            control.spawn(async move {
                token.cancelled().await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        control.cancel_and_wait().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn a_panicking_task_does_not_unwind_into_the_caller() {
        let control = AsyncControl::new(tokio::runtime::Handle::current());
        control.spawn(async { panic!("task panic") });
        control.cancel_and_wait().await;
    }
}
