//! Blocking façade over the async core.
//!
//! A single background tokio runtime hosts the async components; blocking
//! callers submit futures to it and wait for the result. The default
//! runtime is process-global and lazily built; its thread count comes from
//! `COMMAND_BUS_SYNC_THREADS`, else `min(32, cpu_count)`. The global can
//! be reconfigured explicitly and reset in tests.

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{BusError, CommandBus, CommandSender, SendRequest, SendResult};
use crate::config::SYNC_THREADS_ENV_VAR;
use crate::handlers::HandlerError;
use crate::models::{BatchMetadata, BatchStatus, CommandMetadata, TroubleshootingItem};
use crate::process::{ProcessError, ProcessReplyRouter, RouterOptions};
use crate::storage::{AuditEvent, CommandFilter};
use crate::tsq::{TroubleshootingQueue, TsqError};
use crate::worker::{ReceivedCommand, Worker, WorkerError};

/// Cap on the default thread count.
const MAX_DEFAULT_THREADS: usize = 32;

/// Errors from the sync façade's lifecycle plumbing.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to build sync runtime: {0}")]
    Build(#[from] std::io::Error),

    #[error("thread pool size must be positive")]
    InvalidThreadCount,

    #[error("{component} is already running")]
    AlreadyRunning { component: &'static str },

    #[error("background task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Router(#[from] ProcessError),
}

/// Runs futures on a dedicated background tokio runtime.
pub struct SyncRuntime {
    runtime: tokio::runtime::Runtime,
}

impl SyncRuntime {
    /// Build a runtime with the resolved default thread count.
    pub fn new() -> Result<Self, SyncError> {
        Self::with_threads(thread_pool_size())
    }

    pub fn with_threads(threads: usize) -> Result<Self, SyncError> {
        if threads == 0 {
            return Err(SyncError::InvalidThreadCount);
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("commandbus-sync")
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    /// Execute a future to completion and return its output.
    ///
    /// Must be called from a thread that is not itself driving a tokio
    /// runtime.
    pub fn run<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Spawn a future onto the background runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }
}

static DEFAULT_RUNTIME: Mutex<Option<Arc<SyncRuntime>>> = Mutex::new(None);
static DEFAULT_THREADS: Mutex<Option<usize>> = Mutex::new(None);

/// Override the global defaults for sync wrappers.
pub fn configure(
    runtime: Option<Arc<SyncRuntime>>,
    thread_pool_size: Option<usize>,
) -> Result<(), SyncError> {
    if let Some(threads) = thread_pool_size {
        if threads == 0 {
            return Err(SyncError::InvalidThreadCount);
        }
        *DEFAULT_THREADS.lock().unwrap_or_else(|e| e.into_inner()) = Some(threads);
    }
    if let Some(runtime) = runtime {
        *DEFAULT_RUNTIME.lock().unwrap_or_else(|e| e.into_inner()) = Some(runtime);
    }
    Ok(())
}

/// The process-wide default runtime, built on first use.
pub fn default_runtime() -> Result<Arc<SyncRuntime>, SyncError> {
    let mut guard = DEFAULT_RUNTIME.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(runtime) = guard.as_ref() {
        return Ok(runtime.clone());
    }
    let runtime = Arc::new(SyncRuntime::new()?);
    *guard = Some(runtime.clone());
    Ok(runtime)
}

/// Effective thread count: configured value, then the
/// `COMMAND_BUS_SYNC_THREADS` env var, then `min(32, cpu_count)`.
pub fn thread_pool_size() -> usize {
    if let Some(threads) = *DEFAULT_THREADS.lock().unwrap_or_else(|e| e.into_inner()) {
        return threads;
    }
    if let Ok(value) = std::env::var(SYNC_THREADS_ENV_VAR) {
        if let Ok(parsed) = value.parse::<usize>() {
            if parsed > 0 {
                return parsed;
            }
        }
    }
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.min(MAX_DEFAULT_THREADS)
}

/// Drop the global runtime and thread override.
///
/// For tests only. Must not be called from inside a tokio runtime: the
/// dropped runtime shuts down synchronously.
pub fn reset_for_tests() {
    *DEFAULT_RUNTIME.lock().unwrap_or_else(|e| e.into_inner()) = None;
    *DEFAULT_THREADS.lock().unwrap_or_else(|e| e.into_inner()) = None;
}

/// Blocking adapter over [`CommandBus`].
pub struct SyncCommandBus {
    inner: Arc<CommandBus>,
    runtime: Arc<SyncRuntime>,
}

impl SyncCommandBus {
    pub fn new(pool: PgPool) -> Result<Self, SyncError> {
        Ok(Self {
            inner: Arc::new(CommandBus::new(pool)),
            runtime: default_runtime()?,
        })
    }

    pub fn with_runtime(pool: PgPool, runtime: Arc<SyncRuntime>) -> Self {
        Self {
            inner: Arc::new(CommandBus::new(pool)),
            runtime,
        }
    }

    pub fn ensure_queue(&self, domain: &str) -> Result<(), BusError> {
        self.runtime.run(self.inner.ensure_queue(domain))
    }

    pub fn send(&self, request: SendRequest) -> Result<SendResult, BusError> {
        self.runtime.run(self.inner.send(request))
    }

    pub fn send_batch(
        &self,
        requests: Vec<SendRequest>,
        chunk_size: usize,
    ) -> Result<Vec<Result<SendResult, BusError>>, BusError> {
        self.runtime.run(self.inner.send_batch(requests, chunk_size))
    }

    pub fn create_batch(
        &self,
        domain: &str,
        name: &str,
        custom_data: Option<Value>,
        requests: Vec<SendRequest>,
        chunk_size: usize,
    ) -> Result<(Uuid, Vec<Result<SendResult, BusError>>), BusError> {
        self.runtime.run(
            self.inner
                .create_batch(domain, name, custom_data, requests, chunk_size),
        )
    }

    pub fn get_batch(&self, domain: &str, batch_id: Uuid) -> Result<Option<BatchMetadata>, BusError> {
        self.runtime.run(self.inner.get_batch(domain, batch_id))
    }

    pub fn list_batches(
        &self,
        domain: &str,
        status: Option<BatchStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<BatchMetadata>, BusError> {
        self.runtime
            .run(self.inner.list_batches(domain, status, limit, offset))
    }

    pub fn get_command(
        &self,
        domain: &str,
        command_id: Uuid,
    ) -> Result<Option<CommandMetadata>, BusError> {
        self.runtime.run(self.inner.get_command(domain, command_id))
    }

    pub fn query_commands(&self, filter: &CommandFilter) -> Result<Vec<CommandMetadata>, BusError> {
        self.runtime.run(self.inner.query_commands(filter))
    }

    pub fn get_audit_trail(
        &self,
        domain: &str,
        command_id: Uuid,
    ) -> Result<Vec<AuditEvent>, BusError> {
        self.runtime.run(self.inner.get_audit_trail(domain, command_id))
    }
}

/// Blocking adapter over [`Worker`].
pub struct SyncWorker {
    worker: Arc<Worker>,
    runtime: Arc<SyncRuntime>,
    handle: Mutex<Option<JoinHandle<Result<(), WorkerError>>>>,
}

impl SyncWorker {
    pub fn new(worker: Worker) -> Result<Self, SyncError> {
        Ok(Self {
            worker: Arc::new(worker),
            runtime: default_runtime()?,
            handle: Mutex::new(None),
        })
    }

    pub fn with_runtime(worker: Worker, runtime: Arc<SyncRuntime>) -> Self {
        Self {
            worker: Arc::new(worker),
            runtime,
            handle: Mutex::new(None),
        }
    }

    /// Start the worker loop. With `block` the call returns only after
    /// [`SyncWorker::stop`] from another thread.
    pub fn run(&self, block: bool) -> Result<(), SyncError> {
        {
            let guard = self.handle.lock().unwrap_or_else(|e| e.into_inner());
            if guard.as_ref().is_some_and(|h| !h.is_finished()) {
                return Err(SyncError::AlreadyRunning {
                    component: "worker",
                });
            }
        }

        let worker = self.worker.clone();
        let handle = self.runtime.spawn(async move { worker.run().await });

        if block {
            return match self.runtime.run(handle) {
                Ok(result) => Ok(result?),
                Err(join_err) => Err(SyncError::Join(join_err.to_string())),
            };
        }

        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop the worker and wait for the loop to drain.
    pub fn stop(&self) -> Result<(), SyncError> {
        self.worker.stop();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            match self.runtime.run(handle) {
                Ok(result) => result?,
                Err(join_err) => return Err(SyncError::Join(join_err.to_string())),
            }
        }
        Ok(())
    }

    /// Blocking receive; same contract as [`Worker::receive`].
    pub fn receive(
        &self,
        batch_size: i32,
        visibility_timeout: Option<i32>,
    ) -> Result<Vec<ReceivedCommand>, WorkerError> {
        self.runtime
            .run(self.worker.receive(batch_size, visibility_timeout))
    }

    pub fn complete(
        &self,
        received: &ReceivedCommand,
        result: Option<Value>,
    ) -> Result<(), WorkerError> {
        self.runtime.run(self.worker.complete(received, result))
    }

    pub fn fail(&self, received: &ReceivedCommand, error: &HandlerError) -> Result<(), WorkerError> {
        self.runtime.run(self.worker.fail(received, error))
    }
}

/// Blocking adapter over [`TroubleshootingQueue`].
pub struct SyncTroubleshootingQueue {
    inner: Arc<TroubleshootingQueue>,
    runtime: Arc<SyncRuntime>,
}

impl SyncTroubleshootingQueue {
    pub fn new(pool: PgPool) -> Result<Self, SyncError> {
        Ok(Self {
            inner: Arc::new(TroubleshootingQueue::new(pool)),
            runtime: default_runtime()?,
        })
    }

    pub fn with_runtime(pool: PgPool, runtime: Arc<SyncRuntime>) -> Self {
        Self {
            inner: Arc::new(TroubleshootingQueue::new(pool)),
            runtime,
        }
    }

    pub fn list_troubleshooting(
        &self,
        domain: &str,
        command_type: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TroubleshootingItem>, TsqError> {
        self.runtime.run(
            self.inner
                .list_troubleshooting(domain, command_type, limit, offset),
        )
    }

    pub fn count_troubleshooting(
        &self,
        domain: &str,
        command_type: Option<&str>,
    ) -> Result<i64, TsqError> {
        self.runtime
            .run(self.inner.count_troubleshooting(domain, command_type))
    }

    pub fn list_domains(&self) -> Result<Vec<String>, TsqError> {
        self.runtime.run(self.inner.list_domains())
    }

    pub fn operator_retry(
        &self,
        domain: &str,
        command_id: Uuid,
        operator: &str,
    ) -> Result<i64, TsqError> {
        self.runtime
            .run(self.inner.operator_retry(domain, command_id, operator))
    }

    pub fn operator_cancel(
        &self,
        domain: &str,
        command_id: Uuid,
        operator: &str,
        reason: Option<&str>,
    ) -> Result<(), TsqError> {
        self.runtime.run(
            self.inner
                .operator_cancel(domain, command_id, operator, reason),
        )
    }

    pub fn operator_complete(
        &self,
        domain: &str,
        command_id: Uuid,
        operator: &str,
        result_data: Option<Value>,
    ) -> Result<(), TsqError> {
        self.runtime.run(
            self.inner
                .operator_complete(domain, command_id, operator, result_data),
        )
    }
}

/// Blocking adapter over [`ProcessReplyRouter`].
pub struct SyncProcessReplyRouter {
    router: Arc<ProcessReplyRouter>,
    runtime: Arc<SyncRuntime>,
    handle: Mutex<Option<JoinHandle<Result<(), ProcessError>>>>,
}

impl SyncProcessReplyRouter {
    pub fn new(router: ProcessReplyRouter) -> Result<Self, SyncError> {
        Ok(Self {
            router: Arc::new(router),
            runtime: default_runtime()?,
            handle: Mutex::new(None),
        })
    }

    pub fn with_runtime(router: ProcessReplyRouter, runtime: Arc<SyncRuntime>) -> Self {
        Self {
            router: Arc::new(router),
            runtime,
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.router.is_running()
    }

    /// Start the router loop. With `block` the call returns only after
    /// [`SyncProcessReplyRouter::stop`] from another thread.
    pub fn run(&self, block: bool, options: RouterOptions) -> Result<(), SyncError> {
        {
            let guard = self.handle.lock().unwrap_or_else(|e| e.into_inner());
            if guard.as_ref().is_some_and(|h| !h.is_finished()) {
                return Err(SyncError::AlreadyRunning {
                    component: "process reply router",
                });
            }
        }

        let router = self.router.clone();
        let handle = self.runtime.spawn(async move { router.run(options).await });

        if block {
            return match self.runtime.run(handle) {
                Ok(result) => Ok(result?),
                Err(join_err) => Err(SyncError::Join(join_err.to_string())),
            };
        }

        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop the router and wait for the loop to exit.
    pub fn stop(&self) -> Result<(), SyncError> {
        self.router.stop();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            match self.runtime.run(handle) {
                Ok(result) => result?,
                Err(join_err) => return Err(SyncError::Join(join_err.to_string())),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_thread_pool_size_defaults_to_cpus() {
        reset_for_tests();
        std::env::remove_var(SYNC_THREADS_ENV_VAR);
        let size = thread_pool_size();
        assert!(size >= 1);
        assert!(size <= MAX_DEFAULT_THREADS);
    }

    #[test]
    #[serial]
    fn test_thread_pool_size_from_env() {
        reset_for_tests();
        std::env::set_var(SYNC_THREADS_ENV_VAR, "7");
        assert_eq!(thread_pool_size(), 7);
        std::env::remove_var(SYNC_THREADS_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_thread_pool_size_ignores_invalid_env() {
        reset_for_tests();
        std::env::set_var(SYNC_THREADS_ENV_VAR, "not-a-number");
        let size = thread_pool_size();
        assert!(size >= 1);
        std::env::remove_var(SYNC_THREADS_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_configure_overrides_thread_count() {
        reset_for_tests();
        configure(None, Some(3)).unwrap();
        assert_eq!(thread_pool_size(), 3);
        reset_for_tests();
    }

    #[test]
    #[serial]
    fn test_configure_rejects_zero_threads() {
        reset_for_tests();
        assert!(matches!(
            configure(None, Some(0)),
            Err(SyncError::InvalidThreadCount)
        ));
        reset_for_tests();
    }

    #[test]
    #[serial]
    fn test_default_runtime_is_shared() {
        reset_for_tests();
        configure(None, Some(1)).unwrap();
        let a = default_runtime().unwrap();
        let b = default_runtime().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        reset_for_tests();
    }

    #[test]
    #[serial]
    fn test_runtime_runs_futures() {
        let runtime = SyncRuntime::with_threads(1).unwrap();
        let value = runtime.run(async { 41 + 1 });
        assert_eq!(value, 42);
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(
            SyncRuntime::with_threads(0),
            Err(SyncError::InvalidThreadCount)
        ));
    }
}
