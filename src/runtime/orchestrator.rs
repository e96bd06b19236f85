//! Runtime orchestrator: the single owner of the worker and of the runtime
//! status.
//!
//! Lock order is `flight` then `worker`. `flight` is held for the whole of a
//! top-level call so unrelated calls are rejected with [`EngineError::Busy`]
//! instead of queueing behind it; cases of one batch run inside that call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc::Sender};
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;

use crate::{
    config::RuntimeConfig,
    core::{
        domain::{
            ErrorKind, ExecutionRequest, ExecutionResult, RuntimeInfo, RuntimeStatus, TestCase,
            TestCaseResult,
        },
        interrupt::InterruptChannel,
        pipeline::batch::{self, BatchSubmission},
        traits::{
            executor::CaseExecutor,
            worker::{Worker, WorkerFactory},
        },
    },
    lua::LuaWorkerFactory,
    runtime::{
        errors::EngineError,
        status::{StatusBoard, Subscription},
    },
};

/// Options of a single [`Runtime::run_code`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub entry_point: Option<String>,
    pub timeout_ms: Option<u64>,
    pub args: Vec<serde_json::Value>,
}

impl RunOptions {
    fn into_request(self, code: &str) -> ExecutionRequest {
        let mut request = ExecutionRequest::new(code).with_args(self.args);
        request.entry_point = self.entry_point;
        request.timeout_ms = self.timeout_ms;
        request
    }
}

/// Handle to the runtime. Cheap to clone; clones share the same worker.
#[derive(Debug, Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: RuntimeConfig,
    factory: Arc<dyn WorkerFactory>,
    interrupt: InterruptChannel,
    status: Arc<StatusBoard>,
    worker: Mutex<Option<Arc<dyn Worker>>>,
    flight: Mutex<()>,
    in_flight: AtomicBool,
    restart_pending: AtomicBool,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                interrupt: InterruptChannel::new(),
                status: StatusBoard::new(),
                worker: Mutex::new(None),
                flight: Mutex::new(()),
                in_flight: AtomicBool::new(false),
                restart_pending: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_lua(config: RuntimeConfig) -> Self {
        Self::new(config, Arc::new(LuaWorkerFactory::new()))
    }

    /// Starts the worker unless it is already running. Concurrent callers
    /// wait for the same startup.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), EngineError> {
        self.inner.ensure_worker().await.map(|_| ())
    }

    #[tracing::instrument(skip_all, fields(request_id = %request.id))]
    pub async fn run(&self, request: ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        let _flight = self.inner.flight.try_lock().map_err(|_| EngineError::Busy)?;

        // In flight from here on, so an abort during lazy startup still counts.
        self.inner.begin_flight();
        let result = match self.inner.ensure_worker().await {
            Ok(_) if self.inner.interrupt.is_raised() => {
                tracing::info!("Aborted before dispatch");
                Ok(ExecutionResult::failure(
                    ErrorKind::Interrupted,
                    "execution was aborted",
                    0,
                ))
            }
            Ok(worker) => Ok(self.inner.execute_once(worker, request).await),
            Err(e) => Err(e),
        };
        self.inner.end_flight();

        result
    }

    pub async fn run_code(
        &self,
        code: &str,
        options: RunOptions,
    ) -> Result<ExecutionResult, EngineError> {
        self.run(options.into_request(code)).await
    }

    pub async fn run_batch(
        &self,
        code: &str,
        entry_point: &str,
        test_cases: &[TestCase],
    ) -> Result<Vec<TestCaseResult>, EngineError> {
        let submission = BatchSubmission {
            code,
            entry_point,
            test_cases,
            timeout_ms: None,
        };
        self.run_batch_with_progress(submission, None).await
    }

    /// Runs a batch, sending a snapshot of all case results to `progress_tx`
    /// after every case transition.
    #[tracing::instrument(skip_all, fields(cases = submission.test_cases.len()))]
    pub async fn run_batch_with_progress(
        &self,
        submission: BatchSubmission<'_>,
        progress_tx: Option<&Sender<Vec<TestCaseResult>>>,
    ) -> Result<Vec<TestCaseResult>, EngineError> {
        let _flight = self.inner.flight.try_lock().map_err(|_| EngineError::Busy)?;

        self.inner.begin_flight();
        let results = match self.inner.ensure_worker().await {
            Ok(_) => {
                let dispatcher = BatchDispatcher { inner: &self.inner };
                Ok(batch::run_batch(submission, &dispatcher, progress_tx).await)
            }
            Err(e) => Err(e),
        };
        self.inner.end_flight();

        results
    }

    /// Requests cancellation of the in-flight run or batch. Does nothing when
    /// idle, so a stale abort never cancels the next run.
    pub fn abort(&self) {
        if self.inner.in_flight.load(Ordering::Acquire) {
            tracing::info!("Abort requested");
            self.inner.interrupt.signal_abort();
        } else {
            tracing::debug!("Abort ignored, nothing is running");
        }
    }

    pub fn status(&self) -> RuntimeInfo {
        self.inner.status.snapshot()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&RuntimeInfo) + Send + Sync + 'static,
    {
        self.inner.status.subscribe(Arc::new(listener))
    }

    pub fn watch(&self) -> WatchStream<RuntimeInfo> {
        self.inner.status.watch()
    }

    /// Tears down the worker and starts a fresh one, cancelling whatever is
    /// running first.
    #[tracing::instrument(skip(self))]
    pub async fn reset(&self) -> Result<(), EngineError> {
        if self.inner.in_flight.load(Ordering::Acquire) {
            self.inner.interrupt.signal_abort();
        }
        let _flight = self.inner.flight.lock().await;
        let mut slot = self.inner.worker.lock().await;
        self.inner.interrupt.reset();

        self.inner.start_worker(&mut slot).await.map(|_| ())
    }
}

impl Inner {
    async fn ensure_worker(&self) -> Result<Arc<dyn Worker>, EngineError> {
        let mut slot = self.worker.lock().await;
        let restart = self.restart_pending.load(Ordering::Acquire);
        if let (Some(worker), false) = (slot.as_ref(), restart) {
            return Ok(Arc::clone(worker));
        }

        let info = self.status.snapshot();
        if info.status == RuntimeStatus::Error && !restart {
            return Err(EngineError::Unavailable {
                last_error: info
                    .last_error
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        if restart {
            tracing::warn!("Restarting worker after crash");
        }

        self.start_worker(&mut slot).await
    }

    async fn start_worker(
        &self,
        slot: &mut Option<Arc<dyn Worker>>,
    ) -> Result<Arc<dyn Worker>, EngineError> {
        if let Some(old) = slot.take() {
            tracing::debug!("Tearing down worker");
            old.shutdown();
        }
        self.status.update(|info| {
            info.status = RuntimeStatus::Loading;
            info.last_error = None;
        });

        let started = Instant::now();
        let spawned = tokio::time::timeout(
            self.config.startup_timeout(),
            self.factory.spawn(&self.config, self.interrupt.clone()),
        )
        .await;
        self.restart_pending.store(false, Ordering::Release);

        let error = match spawned {
            Ok(Ok(worker)) => {
                let init_ms = started.elapsed().as_millis() as u64;
                self.status.update(|info| {
                    info.status = RuntimeStatus::Ready;
                    info.interpreter_version = Some(worker.interpreter_version());
                    info.memory_usage_bytes = Some(worker.memory_usage_bytes());
                    info.init_duration_ms = Some(init_ms);
                });
                tracing::info!(init_ms, "Runtime ready");
                *slot = Some(Arc::clone(&worker));
                return Ok(worker);
            }
            Ok(Err(e)) => EngineError::InitializationFailed { msg: e.to_string() },
            Err(_) => EngineError::StartupTimeout {
                timeout_ms: self.config.startup_timeout_ms,
            },
        };

        tracing::error!("Runtime initialization failed: {}", error);
        self.status.update(|info| {
            info.status = RuntimeStatus::Error;
            info.last_error = Some(error.to_string());
        });
        Err(error)
    }

    fn begin_flight(&self) {
        // A stale abort from before this call must not cancel it.
        self.interrupt.reset();
        self.in_flight.store(true, Ordering::Release);
    }

    fn end_flight(&self) {
        self.in_flight.store(false, Ordering::Release);
        self.interrupt.reset();
        if self.status.snapshot().status == RuntimeStatus::Running {
            self.status.update(|info| info.status = RuntimeStatus::Ready);
        }
    }

    /// Dispatches one request and always comes back with a result. A worker
    /// that outlives its deadline plus grace is abandoned and replaced.
    async fn execute_once(
        &self,
        worker: Arc<dyn Worker>,
        request: ExecutionRequest,
    ) -> ExecutionResult {
        let timeout = self.config.effective_timeout(request.timeout_ms);
        let budget = timeout + self.config.hard_kill_grace();
        self.status.update(|info| info.status = RuntimeStatus::Running);

        let started = Instant::now();
        let outcome = tokio::time::timeout(budget, worker.execute(request)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(result)) => {
                tracing::debug!("Execution result: {:?}", result.kind);
                self.status.update(|info| {
                    info.last_run_duration_ms = Some(result.execution_time_ms);
                    info.memory_usage_bytes = Some(worker.memory_usage_bytes());
                });
                result
            }
            Ok(Err(e)) => {
                tracing::error!("Worker crashed during run: {}", e);
                self.restart_pending.store(true, Ordering::Release);
                self.status.update(|info| {
                    info.status = RuntimeStatus::Error;
                    info.last_error = Some(e.to_string());
                    info.last_run_duration_ms = Some(elapsed_ms);
                });
                ExecutionResult::failure(ErrorKind::InternalError, e.to_string(), elapsed_ms)
            }
            Err(_) => {
                let (kind, msg) = if self.interrupt.is_raised() {
                    (ErrorKind::Interrupted, "execution was aborted".to_string())
                } else {
                    (
                        ErrorKind::Timeout,
                        format!("execution exceeded {}ms", timeout.as_millis()),
                    )
                };
                tracing::warn!(
                    "Worker unresponsive {}ms past its deadline, replacing it",
                    self.config.hard_kill_grace_ms
                );
                worker.shutdown();
                self.status.update(|info| info.last_run_duration_ms = Some(elapsed_ms));

                let mut slot = self.worker.lock().await;
                if let Err(e) = self.start_worker(&mut slot).await {
                    tracing::error!("Could not replace unresponsive worker: {}", e);
                }
                ExecutionResult::failure(kind, msg, elapsed_ms)
            }
        }
    }
}

/// Feeds batch cases through the orchestrator so each one gets the same
/// timeout, crash recovery and status reporting as a top-level run.
struct BatchDispatcher<'a> {
    inner: &'a Inner,
}

#[async_trait::async_trait]
impl CaseExecutor for BatchDispatcher<'_> {
    async fn execute_case(&self, request: ExecutionRequest) -> ExecutionResult {
        match self.inner.ensure_worker().await {
            Ok(worker) => self.inner.execute_once(worker, request).await,
            Err(e) => ExecutionResult::failure(ErrorKind::InternalError, e.to_string(), 0),
        }
    }

    fn abort_requested(&self) -> bool {
        self.inner.interrupt.is_raised()
    }
}
