//! Last-resort panic containment for lifecycle entry points.
//!
//! A panic anywhere inside a pipeline's start/stop path is caught at the
//! pipeline boundary, logged, and swallowed: the agent keeps running. This is
//! a containment boundary, not a substitute for plugin-level validation.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};

use futures::FutureExt;

/// Runs `f` and contains any panic it raises.
///
/// A recovered panic is logged at error level, tagged with `op`, and the call
/// returns `default` instead of unwinding into the caller.
pub(crate) fn guard<T>(op: &str, default: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            log::error!("PLUGIN_RUNTIME_ALARM: {op} panicked: {}", payload_str(payload.as_ref()));
            default
        }
    }
}

/// Async counterpart of [`guard`].
pub(crate) async fn guard_async<T>(op: &str, default: T, fut: impl Future<Output = T>) -> T {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => value,
        Err(payload) => {
            log::error!("PLUGIN_RUNTIME_ALARM: {op} panicked: {}", payload_str(payload.as_ref()));
            default
        }
    }
}

/// Best-effort extraction of a panic message from its payload.
pub(crate) fn payload_str(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

/// Installs a process-wide hook that logs every panic with a backtrace.
///
/// `catch_unwind` only carries the payload; the stack must be captured here,
/// at the panic site. Installing the hook twice is harmless (the previous
/// hook is chained).
pub fn install_panic_logging() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let backtrace = Backtrace::force_capture();
        log::error!("PLUGIN_RUNTIME_ALARM: {info}\n{backtrace}");
        previous(info);
    }));
}
