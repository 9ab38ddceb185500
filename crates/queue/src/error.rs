use chorus_core::types::JobId;
use chorus_db::models::status::StatusId;
use chorus_db::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job {id} has unknown status id {status_id}")]
    UnknownStatus { id: JobId, status_id: StatusId },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl QueueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Store(e) if e.is_retryable())
    }
}
