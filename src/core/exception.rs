//! Exception handlers for failing task rounds.

use tracing::error;

use crate::core::task::TaskHandle;
use crate::core::JobError;

/// Receives the failure of every task round that ends in an error.
///
/// Called on the worker thread that ran the round, before the manager
/// decides whether the task repeats.
pub trait ExceptionHandler: Send + Sync {
    /// Handle one failed round.
    fn handle(&self, task: &TaskHandle, error: &JobError);
}

impl<F> ExceptionHandler for F
where
    F: Fn(&TaskHandle, &JobError) + Send + Sync,
{
    fn handle(&self, task: &TaskHandle, error: &JobError) {
        self(task, error);
    }
}

/// Default handler: logs the failure at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingExceptionHandler;

impl ExceptionHandler for LoggingExceptionHandler {
    fn handle(&self, task: &TaskHandle, error: &JobError) {
        error!(
            task_id = task.id(),
            task_name = %task.name(),
            correlation_id = %task.correlation_id(),
            error = %error,
            "task round failed"
        );
    }
}
