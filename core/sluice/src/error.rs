use thiserror::Error;

/// Error returned by the lifecycle operations of
/// [`PipelineManager`](crate::manager::PipelineManager).
///
/// Only caller-misuse conditions are reported here. A misbehaving pipeline
/// (stop timeout, panic) is contained and logged instead, because the agent
/// must stay alive even when a pipeline does not.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManagerError {
    /// `stop` or `remove` named a pipeline that is not registered.
    #[error("pipeline not found: {name}")]
    PipelineNotFound { name: String },

    /// `start` named a pipeline that matches neither staging slot.
    ///
    /// This signals a desynchronization between the config loader and the
    /// manager and should never occur in correct operation.
    #[error("no staged pipeline matches '{given}', staged: {staged}")]
    StagedMismatch { given: String, staged: String },
}
