//! Executor driving a connection's protocol engine.

use crate::common::{AmqpError, AmqpResult};
use crate::transport::ProtocolEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Callback receiving failures that escape the engine loop
pub type ExceptionHandler = Arc<dyn Fn(AmqpError) + Send + Sync>;

/// Runs [`ProtocolEngine::run`] on an explicitly chosen runtime.
///
/// One executor belongs to exactly one connection. Failures inside the loop,
/// including panics, are passed to the exception handler instead of being
/// returned to `start`/`close` callers.
pub struct ReactorExecutor {
    connection_id: String,
    engine: Arc<dyn ProtocolEngine>,
    runtime: Handle,
    exception_handler: ExceptionHandler,
    shutdown: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReactorExecutor {
    pub fn new(
        connection_id: impl Into<String>,
        engine: Arc<dyn ProtocolEngine>,
        runtime: Handle,
        exception_handler: ExceptionHandler,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            engine,
            runtime,
            exception_handler,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Spawn the engine loop. May only be called once per executor.
    pub fn start(&self) -> AmqpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::disposed("reactor executor"));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::InvalidOperation(format!(
                "Reactor for connection '{}' has already been started",
                self.connection_id
            )));
        }

        log::info!("Starting reactor for connection '{}'", self.connection_id);

        let engine = self.engine.clone();
        let shutdown = self.shutdown.clone();
        let handler = self.exception_handler.clone();
        let connection_id = self.connection_id.clone();
        let runtime = self.runtime.clone();

        let supervisor = self.runtime.spawn(async move {
            let engine_loop = runtime.spawn(async move { engine.run(shutdown).await });

            match engine_loop.await {
                Ok(Ok(())) => {
                    log::debug!("Reactor loop for connection '{connection_id}' finished");
                }
                Ok(Err(e)) => {
                    log::error!("Reactor loop for connection '{connection_id}' failed: {e}");
                    handler(e);
                }
                Err(e) if e.is_panic() => {
                    log::error!("Reactor loop for connection '{connection_id}' panicked");
                    handler(AmqpError::fatal(format!(
                        "Reactor loop for connection '{connection_id}' panicked"
                    )));
                }
                Err(_) => {
                    log::debug!("Reactor loop for connection '{connection_id}' was cancelled");
                }
            }
        });

        if let Ok(mut task) = self.task.lock() {
            *task = Some(supervisor);
        }
        Ok(())
    }

    /// Request loop termination. Safe to call repeatedly and before `start`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        log::info!("Closing reactor for connection '{}'", self.connection_id);
        self.shutdown.cancel();

        // The loop observes the cancelled token and exits on its own
        if let Ok(mut task) = self.task.lock() {
            task.take();
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ReactorExecutor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
