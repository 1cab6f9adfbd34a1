//! Admission control and the panic boundary shared by job entrypoints.

use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use metrics::counter;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{error, warn};

use crate::application::{classify::ExecutionError, error::JobError};

/// Bounds how many local tool processes run at once.
#[derive(Debug, Clone)]
pub struct JobLimiter {
    permits: Arc<Semaphore>,
    queue_timeout: Duration,
}

impl JobLimiter {
    pub fn new(max_concurrent: usize, queue_timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            queue_timeout,
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait up to the queue timeout for a slot; `Busy` when none frees up.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, JobError> {
        let waited = if self.queue_timeout.is_zero() {
            self.permits.clone().try_acquire_owned().ok()
        } else {
            tokio::time::timeout(self.queue_timeout, self.permits.clone().acquire_owned())
                .await
                .ok()
                .and_then(Result::ok)
        };

        match waited {
            Some(permit) => Ok(permit),
            None => {
                counter!("meshport_export_rejected_busy_total").increment(1);
                warn!(
                    target = "meshport::jobs",
                    op = "limiter::acquire",
                    result = "busy",
                    queue_timeout_ms = self.queue_timeout.as_millis() as u64,
                    "no export slot became available"
                );
                Err(JobError::Busy {
                    retry_after: self.queue_timeout.max(Duration::from_secs(1)),
                })
            }
        }
    }
}

/// Run `job`, turning a panic into an `Unknown` execution error.
///
/// Locals owned by the future (staging guards, child processes) are dropped
/// while unwinding.
pub async fn catch_job_panic<F, T>(context: &'static str, job: F) -> Result<T, JobError>
where
    F: Future<Output = Result<T, JobError>>,
{
    match AssertUnwindSafe(job).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(
                target = "meshport::jobs",
                op = context,
                result = "panic",
                panic = %message,
                "job panicked"
            );
            Err(JobError::Execution(ExecutionError::unknown(format!(
                "internal error while running job: {message}"
            ))))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
