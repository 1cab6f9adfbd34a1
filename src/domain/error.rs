use thiserror::Error;

use super::types::JobState;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("job {job_id} cannot move from {} to {}", .from.as_str(), .to.as_str())]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },
}
