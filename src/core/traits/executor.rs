use crate::core::domain::{ExecutionRequest, ExecutionResult};

/// Executes one test case of a batch against the current worker.
///
/// The batch runner only sees this seam, so every case goes through the same
/// per-request isolation as a top-level run.
#[mockall::automock]
#[async_trait::async_trait]
pub trait CaseExecutor: Send + Sync {
    async fn execute_case(&self, request: ExecutionRequest) -> ExecutionResult;

    /// Whether the user asked to cancel the batch.
    fn abort_requested(&self) -> bool;
}
