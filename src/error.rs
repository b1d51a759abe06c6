use thiserror::Error;

/// Failures the dispatcher and command layer branch on.
///
/// These travel inside `anyhow::Error`; callers recover them with
/// `err.downcast_ref::<DispatchError>()`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("event {0} already has a job")]
    AlreadyQueued(i64),

    #[error("event {0} is not valid for processing (needs wikis, participants and start <= end)")]
    InvalidEvent(i64),

    #[error("insufficient quota: no replica connections available for job processing")]
    InsufficientQuota,

    #[error("event not found: {0}")]
    EventNotFound(i64),

    #[error("job not found: {0}")]
    JobNotFound(i64),

    #[error("statistics computation failed for event {event_id}")]
    ComputationFailure {
        event_id: i64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl DispatchError {
    pub fn of(err: &anyhow::Error) -> Option<&DispatchError> {
        err.downcast_ref::<DispatchError>()
    }
}
