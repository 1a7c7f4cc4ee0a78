//! Error taxonomy for the scheduler.

use thiserror::Error;

/// Errors surfaced by the scheduler and by actor futures.
///
/// Task-internal failures are never silently dropped: they either fail a
/// future or are reported through the owning task's failure handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// A lifecycle hook or internal job failed while the actor was starting.
    /// Fails the start future and drives the task to the closed phase.
    #[error("actor startup failed: {0}")]
    StartupFailure(String),

    /// A job failed while the actor was started. Reported, the task keeps
    /// processing subsequent jobs.
    #[error("job failed: {0}")]
    JobFailure(String),

    /// A lifecycle hook or internal job failed while the actor was closing.
    /// Fails the close future and forces the closed phase.
    #[error("actor closing failed: {0}")]
    ClosingFailure(String),

    /// An external job was submitted to an actor that no longer accepts
    /// submissions.
    #[error("actor is closed")]
    ActorClosed,

    /// A domain-specific, retryable failure. Retry strategies treat this as
    /// a no-progress signal rather than a fatal error.
    #[error("recoverable operation failure: {0}")]
    Recoverable(String),

    /// An operation was attempted in the wrong scheduler state.
    #[error("invalid scheduler state: {0}")]
    InvalidState(String),

    /// The builder was given an unusable configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A bounded wait on a future elapsed before completion.
    #[error("timed out waiting for future")]
    Timeout,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Best-effort extraction of a panic payload into a printable message.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedulerError::StartupFailure("boom".to_string());
        assert_eq!(err.to_string(), "actor startup failed: boom");

        let err = SchedulerError::ActorClosed;
        assert_eq!(err.to_string(), "actor is closed");
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload), "static str");

        let payload: Box<dyn std::any::Any + Send> = Box::new("owned".to_string());
        assert_eq!(panic_message(payload), "owned");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload), "unknown panic");
    }
}
