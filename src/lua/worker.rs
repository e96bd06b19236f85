//! Execution worker hosted on a dedicated OS thread.
//!
//! The Lua VM is created on the thread and never leaves it. The controller
//! talks to it only through [`WorkerCommand`] messages; the interrupt flag is
//! the only state both sides touch directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    config::RuntimeConfig,
    constants::WORKER_THREAD_NAME,
    core::{
        domain::{ExecutionRequest, ExecutionResult},
        interrupt::InterruptChannel,
        traits::worker::{Worker, WorkerError, WorkerFactory},
    },
    lua::sandbox::Sandbox,
};

#[derive(Debug)]
enum WorkerCommand {
    Execute {
        request: ExecutionRequest,
        responder: oneshot::Sender<Result<ExecutionResult, WorkerError>>,
    },
    Shutdown,
}

#[derive(Debug)]
struct ReadySignal {
    version: String,
    memory_bytes: u64,
}

#[derive(Debug)]
pub struct LuaWorker {
    id: Uuid,
    cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
    version: String,
    memory_bytes: Arc<AtomicU64>,
}

#[async_trait::async_trait]
impl Worker for LuaWorker {
    #[tracing::instrument(skip_all, fields(worker_id = %self.id, request_id = %request.id))]
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, WorkerError> {
        let (responder, response) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCommand::Execute { request, responder })
            .map_err(|_| WorkerError::Disconnected)?;

        response.await.map_err(|_| WorkerError::Crashed {
            msg: "worker thread exited before answering".to_string(),
        })?
    }

    fn interpreter_version(&self) -> String {
        self.version.clone()
    }

    fn memory_usage_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Relaxed)
    }

    fn shutdown(&self) {
        if self.cmd_tx.send(WorkerCommand::Shutdown).is_err() {
            tracing::debug!(worker_id = %self.id, "Worker already stopped");
        }
    }
}

impl Drop for LuaWorker {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WorkerCommand::Shutdown);
    }
}

/// Starts [`LuaWorker`]s, one OS thread each.
#[derive(Debug, Default, Clone)]
pub struct LuaWorkerFactory;

impl LuaWorkerFactory {
    pub fn new() -> Self {
        LuaWorkerFactory
    }
}

#[async_trait::async_trait]
impl WorkerFactory for LuaWorkerFactory {
    #[tracing::instrument(skip_all)]
    async fn spawn(
        &self,
        config: &RuntimeConfig,
        interrupt: InterruptChannel,
    ) -> Result<Arc<dyn Worker>, WorkerError> {
        let id = Uuid::new_v4();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let memory_bytes = Arc::new(AtomicU64::new(0));

        let thread_config = config.clone();
        let thread_memory = Arc::clone(&memory_bytes);
        std::thread::Builder::new()
            .name(format!("{WORKER_THREAD_NAME}-{id}"))
            .spawn(move || {
                worker_main(id, thread_config, interrupt, cmd_rx, ready_tx, thread_memory)
            })
            .map_err(|e| WorkerError::StartupFailed { msg: e.to_string() })?;

        let ready = ready_rx
            .await
            .map_err(|_| WorkerError::StartupFailed {
                msg: "worker thread exited during startup".to_string(),
            })?
            .map_err(|msg| WorkerError::StartupFailed { msg })?;

        tracing::info!(worker_id = %id, version = %ready.version, "Worker ready");
        memory_bytes.store(ready.memory_bytes, Ordering::Relaxed);

        Ok(Arc::new(LuaWorker {
            id,
            cmd_tx,
            version: ready.version,
            memory_bytes,
        }))
    }
}

fn worker_main(
    id: Uuid,
    config: RuntimeConfig,
    interrupt: InterruptChannel,
    mut cmd_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    ready_tx: oneshot::Sender<Result<ReadySignal, String>>,
    memory_bytes: Arc<AtomicU64>,
) {
    let sandbox = match Sandbox::new(&config, interrupt) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            tracing::error!(worker_id = %id, "Failed to create interpreter: {}", e);
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };

    let ready = ReadySignal {
        version: sandbox.version(),
        memory_bytes: sandbox.used_memory() as u64,
    };
    if ready_tx.send(Ok(ready)).is_err() {
        tracing::debug!(worker_id = %id, "Nobody waited for worker startup");
        return;
    }

    while let Some(command) = cmd_rx.blocking_recv() {
        match command {
            WorkerCommand::Execute { request, responder } => {
                tracing::debug!(worker_id = %id, request_id = %request.id, "Executing request");
                match sandbox.execute(&request) {
                    Ok(result) => {
                        memory_bytes.store(sandbox.used_memory() as u64, Ordering::Relaxed);
                        if responder.send(Ok(result)).is_err() {
                            tracing::debug!(worker_id = %id, "Result receiver dropped");
                        }
                    }
                    Err(e) => {
                        tracing::error!(worker_id = %id, "Interpreter left in unknown state: {}", e);
                        let _ = responder.send(Err(WorkerError::Crashed { msg: e.to_string() }));
                        break;
                    }
                }
            }
            WorkerCommand::Shutdown => break,
        }
    }

    tracing::debug!(worker_id = %id, "Worker stopped");
}
