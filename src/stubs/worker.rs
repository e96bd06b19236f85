use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::{
    config::RuntimeConfig,
    core::{
        domain::{ErrorKind, ExecutionRequest, ExecutionResult},
        interrupt::InterruptChannel,
        traits::worker::{Worker, WorkerError, WorkerFactory},
    },
};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Worker answering every request with a canned result after `delay`.
#[derive(Debug, Clone)]
pub struct WorkerStub {
    result: Result<ExecutionResult, WorkerError>,
    delay: Duration,
    honors_interrupt: bool,
    interrupt: InterruptChannel,
}

#[async_trait::async_trait]
impl Worker for WorkerStub {
    #[tracing::instrument(skip_all)]
    async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutionResult, WorkerError> {
        let started = Instant::now();
        let deadline = started + self.delay;
        while Instant::now() < deadline {
            if self.honors_interrupt && self.interrupt.is_raised() {
                return Ok(ExecutionResult::failure(
                    ErrorKind::Interrupted,
                    "execution was aborted",
                    started.elapsed().as_millis() as u64,
                ));
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
        tracing::debug!("Execution result: {:?}", self.result);

        self.result.clone()
    }

    fn interpreter_version(&self) -> String {
        "stub 1.0".to_string()
    }

    fn memory_usage_bytes(&self) -> u64 {
        2048
    }

    fn shutdown(&self) {}
}

#[derive(Debug, Clone)]
pub struct WorkerFactoryStub {
    result: Result<ExecutionResult, WorkerError>,
    delay: Duration,
    startup_delay: Duration,
    honors_interrupt: bool,
    spawned: Arc<AtomicUsize>,
}

impl WorkerFactoryStub {
    pub fn new(result: Result<ExecutionResult, WorkerError>, delay: Duration) -> Self {
        Self {
            result,
            delay,
            startup_delay: Duration::ZERO,
            honors_interrupt: true,
            spawned: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_startup_delay(mut self, startup_delay: Duration) -> Self {
        self.startup_delay = startup_delay;
        self
    }

    /// Simulates code stuck outside of any interpreter checkpoint.
    pub fn ignoring_interrupts(mut self) -> Self {
        self.honors_interrupt = false;
        self
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl WorkerFactory for WorkerFactoryStub {
    async fn spawn(
        &self,
        _config: &RuntimeConfig,
        interrupt: InterruptChannel,
    ) -> Result<Arc<dyn Worker>, WorkerError> {
        tokio::time::sleep(self.startup_delay).await;
        self.spawned.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(WorkerStub {
            result: self.result.clone(),
            delay: self.delay,
            honors_interrupt: self.honors_interrupt,
            interrupt,
        }))
    }
}
