//! Host job-queue port.
//!
//! The only surface the engine consumes from the surrounding background-job
//! framework: schedule a job for immediate or delayed execution. Retry-on-
//! error policy stays on the host side: the engine surfaces a step failure
//! and relies on the host re-invoking the run.

use std::time::Duration;

use perdure_types::error::QueueError;
use perdure_types::value::JobDescriptor;

/// Options for one enqueue call.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Delay before the job becomes runnable.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

/// Dispatch port into the host job framework.
pub trait JobQueue: Send + Sync {
    /// Schedule a job for future or immediate execution.
    fn enqueue(
        &self,
        job: &JobDescriptor,
        options: EnqueueOptions,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_options_default_is_immediate() {
        assert!(EnqueueOptions::default().delay.is_none());
        assert_eq!(
            EnqueueOptions::delayed(Duration::from_secs(30)).delay,
            Some(Duration::from_secs(30))
        );
    }
}
