use std::sync::Arc;

use crate::{
    config::RuntimeConfig,
    core::{
        domain::{ExecutionRequest, ExecutionResult},
        interrupt::InterruptChannel,
    },
};

/// An isolated execution context hosting one long-lived interpreter.
///
/// Implementations run one request at a time with a fresh namespace and
/// always answer with a classified [`ExecutionResult`]. `Err` is reserved for
/// the context itself failing.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Worker: std::fmt::Debug + Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, WorkerError>;

    fn interpreter_version(&self) -> String;

    /// Interpreter heap usage measured after the latest run.
    fn memory_usage_bytes(&self) -> u64;

    /// Stops the context. Must not block on a wedged execution.
    fn shutdown(&self);
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait WorkerFactory: std::fmt::Debug + Send + Sync {
    /// Starts a worker and resolves once it reported ready.
    async fn spawn(
        &self,
        config: &RuntimeConfig,
        interrupt: InterruptChannel,
    ) -> Result<Arc<dyn Worker>, WorkerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("worker failed to start: {msg}")]
    StartupFailed { msg: String },
    #[error("worker crashed: {msg}")]
    Crashed { msg: String },
    #[error("worker is disconnected")]
    Disconnected,
}
