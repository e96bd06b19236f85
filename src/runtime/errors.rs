/// Failures of the runtime itself. Problems in the submitted code are never
/// reported through this type; they come back as failed results.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("runtime initialization failed: {msg}")]
    InitializationFailed { msg: String },
    #[error("worker did not become ready within {timeout_ms}ms")]
    StartupTimeout { timeout_ms: u64 },
    #[error("another execution is already in progress")]
    Busy,
    #[error("runtime is unavailable ({last_error}); reset it to recover")]
    Unavailable { last_error: String },
}
