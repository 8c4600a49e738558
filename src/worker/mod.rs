//! Worker: read → dispatch → finalize loop over a domain's command queue.
//!
//! One worker owns one domain. The outer loop wakes on a LISTEN
//! notification or a poll tick, reads a batch, and hands each message to a
//! dispatch task gated by a semaphore of `concurrency` slots. Claiming and
//! finalizing each run in their own short transactions; the handler itself
//! executes with no connection held, so slow handlers cost a slot, not a
//! pooled connection.
//!
//! Nothing a handler does terminates the worker: dispatch errors are
//! classified, recorded, and either retried with backoff or parked in the
//! troubleshooting queue.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, WorkerConfig};
use crate::handlers::{
    DispatchError, HandlerContext, HandlerError, HandlerOptions, HandlerRegistry,
    VisibilityExtender,
};
use crate::models::{
    command_queue, Command, CommandMetadata, CommandStatus, ErrorKind, Reply,
};
use crate::pgmq::{spawn_notify_listener, PgmqClient, PgmqError};
use crate::storage::{
    setup, AuditEventType, AuditLog, BatchOutcome, BatchStore, CommandStore, PostgresAuditLog,
    PostgresBatchStore, PostgresCommandStore, StorageError,
};

/// Error code recorded when a handler fails with something other than the
/// command error taxonomy.
pub const UNEXPECTED_ERROR_CODE: &str = "UNEXPECTED";
/// Error code recorded when no handler is registered for a command type.
pub const HANDLER_NOT_FOUND_CODE: &str = "HANDLER_NOT_FOUND";

/// Worker errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] PgmqError),

    #[error("failed to encode payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("worker is already running")]
    AlreadyRunning,
}

/// A claimed command ready for dispatch.
#[derive(Debug)]
pub struct ReceivedCommand {
    pub command: Command,
    pub msg_id: i64,
    /// Delivery attempt after the claim, 1-based.
    pub attempt: i32,
    pub metadata: CommandMetadata,
}

/// What the worker does about a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureAction {
    /// Terminal failure: `FAILED` reply, status `FAILED`, archive.
    BusinessFailure,
    /// Straight to the troubleshooting queue.
    MoveToTsq,
    /// Retry per policy; exhaustion moves to the troubleshooting queue.
    Retry,
}

fn action_for(err: &DispatchError) -> FailureAction {
    match err {
        DispatchError::Handler(HandlerError::BusinessRule { .. }) => FailureAction::BusinessFailure,
        DispatchError::Handler(HandlerError::Permanent { .. }) => FailureAction::MoveToTsq,
        DispatchError::Handler(HandlerError::Transient { .. }) => FailureAction::Retry,
        // No registered handler: transient, so the command lands in the
        // troubleshooting queue once retries run out.
        DispatchError::NotFound { .. } => FailureAction::Retry,
    }
}

fn error_code_of(err: &DispatchError) -> (String, String) {
    match err {
        DispatchError::Handler(handler_err) => (
            handler_err.code().to_string(),
            handler_err.message().to_string(),
        ),
        DispatchError::NotFound {
            domain,
            command_type,
        } => (
            HANDLER_NOT_FOUND_CODE.to_string(),
            format!("no handler registered for {domain}.{command_type}"),
        ),
    }
}

/// Statement-timeout cancellations and pool acquire timeouts are expected
/// under load; the message simply waits out its visibility timeout.
fn is_recoverable_timeout(err: &WorkerError) -> bool {
    match err {
        WorkerError::Storage(StorageError::Database(db_err)) => {
            crate::storage::is_timeout_error(db_err)
        }
        WorkerError::Queue(PgmqError::Database(db_err)) => crate::storage::is_timeout_error(db_err),
        _ => false,
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

struct InFlightTask {
    command_id: Uuid,
    command_type: String,
    started: Instant,
}

struct VtExtender {
    pgmq: PgmqClient,
    queue_name: String,
    msg_id: i64,
}

#[async_trait]
impl VisibilityExtender for VtExtender {
    async fn extend(&self, seconds: i32) -> Result<(), PgmqError> {
        self.pgmq
            .set_vt(&self.queue_name, self.msg_id, seconds)
            .await
            .map(|_| ())
    }
}

struct WorkerInner {
    pool: PgPool,
    config: WorkerConfig,
    queue_name: String,
    registry: Arc<HandlerRegistry>,
    pgmq: PgmqClient,
    commands: Arc<dyn CommandStore>,
    audit: Arc<dyn AuditLog>,
    batches: Arc<dyn BatchStore>,
    in_flight: Mutex<HashMap<i64, InFlightTask>>,
}

/// Worker for one domain's command queue.
pub struct Worker {
    inner: Arc<WorkerInner>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
}

impl Worker {
    /// Build a worker. Fails when the configuration (including the
    /// timeout hierarchy) does not validate.
    pub fn new(
        pool: PgPool,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let queue_name = command_queue(&config.domain);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(WorkerInner {
                pgmq: PgmqClient::new(pool.clone()),
                commands: Arc::new(PostgresCommandStore::new(pool.clone())),
                audit: Arc::new(PostgresAuditLog::new(pool.clone())),
                batches: Arc::new(PostgresBatchStore::new(pool.clone())),
                queue_name,
                registry,
                config,
                pool,
                in_flight: Mutex::new(HashMap::new()),
            }),
            shutdown_tx,
            running: AtomicBool::new(false),
        })
    }

    pub fn domain(&self) -> &str {
        &self.inner.config.domain
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    /// Signal the run loop to stop reading and drain in-flight tasks.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Read and claim up to `batch_size` commands.
    ///
    /// Messages whose metadata is missing or already terminal are archived
    /// and skipped. The remaining commands come back claimed: attempts
    /// bumped, status `IN_PROGRESS`, `RECEIVED` audited.
    pub async fn receive(
        &self,
        batch_size: i32,
        visibility_timeout: Option<i32>,
    ) -> Result<Vec<ReceivedCommand>, WorkerError> {
        let vt = visibility_timeout.unwrap_or(self.inner.config.timeouts.visibility_timeout_s);
        let messages = self
            .inner
            .pgmq
            .read(&self.inner.queue_name, vt, batch_size)
            .await?;

        let mut received = Vec::with_capacity(messages.len());
        for message in messages {
            match self.inner.claim(message.msg_id, &message.message).await {
                Ok(Some(claimed)) => received.push(claimed),
                Ok(None) => {}
                Err(err) => {
                    // Left invisible until the visibility timeout expires.
                    error!(msg_id = message.msg_id, error = %err, "claim failed");
                }
            }
        }
        Ok(received)
    }

    /// Finish a command successfully: delete the message, mark
    /// `COMPLETED`, reply if requested, audit.
    pub async fn complete(
        &self,
        received: &ReceivedCommand,
        result: Option<Value>,
    ) -> Result<(), WorkerError> {
        self.inner.complete(received, result).await
    }

    /// Apply a handler failure: business failures terminate, permanent
    /// errors park in the troubleshooting queue, transient errors retry
    /// per policy.
    pub async fn fail(
        &self,
        received: &ReceivedCommand,
        error: &HandlerError,
    ) -> Result<(), WorkerError> {
        let options = self
            .inner
            .registry
            .options(&received.command.domain, &received.command.command_type)
            .cloned()
            .unwrap_or_default();
        self.inner
            .fail(received, &DispatchError::Handler(error.clone()), &options)
            .await
    }

    /// Run the worker loop until [`Worker::stop`].
    pub async fn run(&self) -> Result<(), WorkerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning);
        }
        self.shutdown_tx.send_replace(false);
        let result = self.run_loop().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_loop(&self) -> Result<(), WorkerError> {
        let inner = &self.inner;
        inner.pgmq.create_queue(&inner.queue_name).await?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut notify_rx: Option<mpsc::Receiver<()>> = if inner.config.use_notify {
            Some(spawn_notify_listener(
                inner.pool.clone(),
                inner.queue_name.clone(),
            ))
        } else {
            None
        };

        let watchdog = tokio::spawn(watchdog_loop(
            inner.clone(),
            self.shutdown_tx.subscribe(),
        ));

        let semaphore = Arc::new(Semaphore::new(inner.config.concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let poll_interval = Duration::from_secs_f64(inner.config.poll_interval_s);

        info!(
            domain = %inner.config.domain,
            queue = %inner.queue_name,
            concurrency = inner.config.concurrency,
            use_notify = inner.config.use_notify,
            "worker started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            while tasks.try_join_next().is_some() {}

            let wake = async {
                match notify_rx.as_mut() {
                    Some(rx) => {
                        rx.recv().await;
                    }
                    None => futures::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = wake => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }

            self.read_cycle(&semaphore, &mut tasks).await;
        }

        info!(domain = %inner.config.domain, "worker stopping, draining dispatch tasks");
        let grace = Duration::from_secs_f64(inner.config.shutdown_grace_s);
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                domain = %inner.config.domain,
                "graceful deadline elapsed; unfinished messages reappear after visibility timeout"
            );
            tasks.shutdown().await;
        }

        watchdog.abort();
        info!(domain = %inner.config.domain, "worker stopped");
        Ok(())
    }

    /// One read cycle: fetch as many messages as there are free slots and
    /// spawn a dispatch task per message.
    async fn read_cycle(&self, semaphore: &Arc<Semaphore>, tasks: &mut JoinSet<()>) {
        let inner = &self.inner;
        let available = semaphore.available_permits();
        if available == 0 {
            return;
        }

        let batch = inner.config.batch_size.min(available as i32);
        let messages = match inner
            .pgmq
            .read(
                &inner.queue_name,
                inner.config.timeouts.visibility_timeout_s,
                batch,
            )
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                error!(queue = %inner.queue_name, error = %err, "queue read failed");
                return;
            }
        };

        for message in messages {
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let inner = inner.clone();
            tasks.spawn(async move {
                let _permit = permit;
                inner.process_message(message.msg_id, message.message).await;
            });
        }
    }
}

impl WorkerInner {
    /// Claim transaction: skip terminal commands, bump attempts, mark
    /// `IN_PROGRESS`, audit `RECEIVED`.
    async fn claim(
        &self,
        msg_id: i64,
        payload: &Value,
    ) -> Result<Option<ReceivedCommand>, WorkerError> {
        let command: Command = match serde_json::from_value(payload.clone()) {
            Ok(command) => command,
            Err(err) => {
                warn!(msg_id, error = %err, "malformed envelope, archiving");
                self.pgmq.archive(&self.queue_name, msg_id).await?;
                return Ok(None);
            }
        };

        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        let meta = self
            .commands
            .fetch(&command.domain, command.command_id, Some(&mut *tx))
            .await?;
        let Some(meta) = meta else {
            warn!(
                msg_id,
                command_id = %command.command_id,
                "no metadata for command, archiving"
            );
            self.pgmq.archive_in(&mut tx, &self.queue_name, msg_id).await?;
            tx.commit().await.map_err(StorageError::from)?;
            return Ok(None);
        };

        if meta.status.is_terminal() {
            debug!(
                command_id = %command.command_id,
                status = meta.status.as_str(),
                "command already terminal, archiving"
            );
            self.pgmq.archive_in(&mut tx, &self.queue_name, msg_id).await?;
            tx.commit().await.map_err(StorageError::from)?;
            return Ok(None);
        }

        let attempts = if self.config.use_stored_procedures {
            match setup::receive_via_procedure(&mut tx, &command.domain, command.command_id, msg_id)
                .await?
            {
                Some(attempts) => attempts,
                None => {
                    self.pgmq.archive_in(&mut tx, &self.queue_name, msg_id).await?;
                    tx.commit().await.map_err(StorageError::from)?;
                    return Ok(None);
                }
            }
        } else {
            let attempts = self
                .commands
                .increment_attempts(&command.domain, command.command_id, Some(&mut *tx))
                .await?;
            self.commands
                .update_status(
                    &command.domain,
                    command.command_id,
                    CommandStatus::InProgress,
                    Some(&mut *tx),
                )
                .await?;
            self.audit
                .log(
                    &command.domain,
                    command.command_id,
                    AuditEventType::Received,
                    Some(json!({
                        "msg_id": msg_id,
                        "attempt": attempts,
                        "max_attempts": meta.max_attempts,
                    })),
                    Some(&mut *tx),
                )
                .await?;
            attempts
        };

        tx.commit().await.map_err(StorageError::from)?;

        info!(
            domain = %command.domain,
            command_type = %command.command_type,
            command_id = %command.command_id,
            attempt = attempts,
            max_attempts = meta.max_attempts,
            "received command"
        );

        Ok(Some(ReceivedCommand {
            command,
            msg_id,
            attempt: attempts,
            metadata: meta,
        }))
    }

    /// Full per-message pipeline: claim, dispatch outside any transaction,
    /// finalize.
    async fn process_message(&self, msg_id: i64, payload: Value) {
        let received = match self.claim(msg_id, &payload).await {
            Ok(Some(received)) => received,
            Ok(None) => return,
            Err(err) if is_recoverable_timeout(&err) => {
                warn!(msg_id, error = %err, "claim timed out; message redelivers after visibility timeout");
                return;
            }
            Err(err) => {
                error!(msg_id, error = %err, "claim failed; message redelivers after visibility timeout");
                return;
            }
        };

        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).insert(
            msg_id,
            InFlightTask {
                command_id: received.command.command_id,
                command_type: received.command.command_type.clone(),
                started: Instant::now(),
            },
        );

        let context = HandlerContext::new(received.attempt, received.metadata.max_attempts, msg_id)
            .with_extender(Arc::new(VtExtender {
                pgmq: self.pgmq.clone(),
                queue_name: self.queue_name.clone(),
                msg_id,
            }));
        let options = self
            .registry
            .options(&received.command.domain, &received.command.command_type)
            .cloned()
            .unwrap_or_default();

        // A panicking handler counts as an unexpected transient failure;
        // it must not take the dispatch task (or the slot) down with it.
        let outcome = AssertUnwindSafe(self.registry.dispatch(&received.command, &context))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(DispatchError::Handler(HandlerError::transient(
                    UNEXPECTED_ERROR_CODE,
                    &panic_message(panic),
                )))
            });

        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).remove(&msg_id);

        let finalized = match outcome {
            Ok(result) => self.complete(&received, result).await,
            Err(err) => self.fail(&received, &err, &options).await,
        };
        if let Err(err) = finalized {
            if is_recoverable_timeout(&err) {
                warn!(
                    command_id = %received.command.command_id,
                    msg_id,
                    error = %err,
                    "finalize timed out; message redelivers after visibility timeout"
                );
            } else {
                error!(
                    command_id = %received.command.command_id,
                    msg_id,
                    error = %err,
                    "finalize failed; message redelivers after visibility timeout"
                );
            }
        }
    }

    async fn complete(
        &self,
        received: &ReceivedCommand,
        result: Option<Value>,
    ) -> Result<(), WorkerError> {
        let command = &received.command;
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        self.pgmq
            .delete_in(&mut tx, &self.queue_name, received.msg_id)
            .await?;

        let details = json!({
            "msg_id": received.msg_id,
            "reply_to": command.reply_to,
            "has_result": result.is_some(),
        });
        if self.config.use_stored_procedures {
            setup::finish_via_procedure(
                &mut tx,
                &command.domain,
                command.command_id,
                CommandStatus::Completed,
                AuditEventType::Completed,
                None,
                None,
                None,
                Some(&details),
            )
            .await?;
        } else {
            self.commands
                .update_status(
                    &command.domain,
                    command.command_id,
                    CommandStatus::Completed,
                    Some(&mut *tx),
                )
                .await?;
            self.audit
                .log(
                    &command.domain,
                    command.command_id,
                    AuditEventType::Completed,
                    Some(details),
                    Some(&mut *tx),
                )
                .await?;
        }

        if let Some(reply_to) = &command.reply_to {
            let reply = Reply::success(command.command_id, command.correlation_id, result);
            self.pgmq
                .send_in(&mut tx, reply_to, &serde_json::to_value(&reply)?, 0)
                .await?;
            self.pgmq.notify_in(&mut tx, reply_to).await?;
        }

        if let Some(batch_id) = received.metadata.batch_id {
            self.batches
                .record_outcome(&command.domain, batch_id, BatchOutcome::Completed, Some(&mut *tx))
                .await?;
        }

        tx.commit().await.map_err(StorageError::from)?;
        info!(
            domain = %command.domain,
            command_type = %command.command_type,
            command_id = %command.command_id,
            "completed command"
        );
        Ok(())
    }

    async fn fail(
        &self,
        received: &ReceivedCommand,
        err: &DispatchError,
        options: &HandlerOptions,
    ) -> Result<(), WorkerError> {
        let (code, message) = error_code_of(err);
        match action_for(err) {
            FailureAction::BusinessFailure => self.fail_business(received, &code, &message).await,
            FailureAction::MoveToTsq => {
                self.move_to_tsq(received, ErrorKind::Permanent, &code, &message, false, options)
                    .await
            }
            FailureAction::Retry => {
                if self.config.retry_policy.should_retry(received.attempt) {
                    self.schedule_retry(received, &code, &message).await
                } else {
                    self.move_to_tsq(received, ErrorKind::Transient, &code, &message, true, options)
                        .await
                }
            }
        }
    }

    /// Terminal business failure: reply `FAILED`, status `FAILED`, archive.
    /// No troubleshooting enrollment; no operator action changes a
    /// violated business rule.
    async fn fail_business(
        &self,
        received: &ReceivedCommand,
        code: &str,
        message: &str,
    ) -> Result<(), WorkerError> {
        let command = &received.command;
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        if let Some(reply_to) = &command.reply_to {
            let reply = Reply::failed(command.command_id, command.correlation_id, code, message);
            self.pgmq
                .send_in(&mut tx, reply_to, &serde_json::to_value(&reply)?, 0)
                .await?;
            self.pgmq.notify_in(&mut tx, reply_to).await?;
        }

        let details = json!({
            "error_code": code,
            "error_message": message,
            "attempt": received.attempt,
        });
        if self.config.use_stored_procedures {
            setup::finish_via_procedure(
                &mut tx,
                &command.domain,
                command.command_id,
                CommandStatus::Failed,
                AuditEventType::Failed,
                Some(ErrorKind::Permanent.as_str()),
                Some(code),
                Some(message),
                Some(&details),
            )
            .await?;
        } else {
            self.commands
                .update_status(
                    &command.domain,
                    command.command_id,
                    CommandStatus::Failed,
                    Some(&mut *tx),
                )
                .await?;
            self.commands
                .record_error(
                    &command.domain,
                    command.command_id,
                    ErrorKind::Permanent,
                    code,
                    message,
                    Some(&mut *tx),
                )
                .await?;
            self.audit
                .log(
                    &command.domain,
                    command.command_id,
                    AuditEventType::Failed,
                    Some(details),
                    Some(&mut *tx),
                )
                .await?;
        }

        self.pgmq
            .archive_in(&mut tx, &self.queue_name, received.msg_id)
            .await?;

        tx.commit().await.map_err(StorageError::from)?;
        info!(
            domain = %command.domain,
            command_id = %command.command_id,
            error_code = code,
            "command failed on business rule"
        );
        Ok(())
    }

    /// Transient failure with retries left: re-hide the message for the
    /// backoff, put the status back to `PENDING`, audit the schedule.
    async fn schedule_retry(
        &self,
        received: &ReceivedCommand,
        code: &str,
        message: &str,
    ) -> Result<(), WorkerError> {
        let command = &received.command;
        let backoff = self.config.retry_policy.backoff_for(received.attempt);
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        self.pgmq
            .set_vt_in(&mut tx, &self.queue_name, received.msg_id, backoff)
            .await?;

        let details = json!({
            "backoff": backoff,
            "next_attempt": received.attempt + 1,
            "error_code": code,
        });
        if self.config.use_stored_procedures {
            setup::finish_via_procedure(
                &mut tx,
                &command.domain,
                command.command_id,
                CommandStatus::Pending,
                AuditEventType::RetryScheduled,
                Some(ErrorKind::Transient.as_str()),
                Some(code),
                Some(message),
                Some(&details),
            )
            .await?;
        } else {
            self.commands
                .update_status(
                    &command.domain,
                    command.command_id,
                    CommandStatus::Pending,
                    Some(&mut *tx),
                )
                .await?;
            self.commands
                .record_error(
                    &command.domain,
                    command.command_id,
                    ErrorKind::Transient,
                    code,
                    message,
                    Some(&mut *tx),
                )
                .await?;
            self.audit
                .log(
                    &command.domain,
                    command.command_id,
                    AuditEventType::RetryScheduled,
                    Some(details),
                    Some(&mut *tx),
                )
                .await?;
        }

        tx.commit().await.map_err(StorageError::from)?;
        info!(
            domain = %command.domain,
            command_id = %command.command_id,
            backoff,
            next_attempt = received.attempt + 1,
            "scheduled retry"
        );
        Ok(())
    }

    /// Park a command for operator attention. The message is archived so
    /// the envelope survives in `pgmq.a_<queue>` for inspection and
    /// replay.
    async fn move_to_tsq(
        &self,
        received: &ReceivedCommand,
        kind: ErrorKind,
        code: &str,
        message: &str,
        exhausted: bool,
        options: &HandlerOptions,
    ) -> Result<(), WorkerError> {
        let command = &received.command;
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        if exhausted {
            self.audit
                .log(
                    &command.domain,
                    command.command_id,
                    AuditEventType::RetryExhausted,
                    Some(json!({
                        "attempts": received.attempt,
                        "max_attempts": received.metadata.max_attempts,
                    })),
                    Some(&mut *tx),
                )
                .await?;
        }

        let details = json!({
            "error_code": code,
            "error_message": message,
            "attempts": received.attempt,
        });
        if self.config.use_stored_procedures {
            setup::finish_via_procedure(
                &mut tx,
                &command.domain,
                command.command_id,
                CommandStatus::InTroubleshootingQueue,
                AuditEventType::MovedToTsq,
                Some(kind.as_str()),
                Some(code),
                Some(message),
                Some(&details),
            )
            .await?;
        } else {
            self.commands
                .update_status(
                    &command.domain,
                    command.command_id,
                    CommandStatus::InTroubleshootingQueue,
                    Some(&mut *tx),
                )
                .await?;
            self.commands
                .record_error(
                    &command.domain,
                    command.command_id,
                    kind,
                    code,
                    message,
                    Some(&mut *tx),
                )
                .await?;
            self.audit
                .log(
                    &command.domain,
                    command.command_id,
                    AuditEventType::MovedToTsq,
                    Some(details),
                    Some(&mut *tx),
                )
                .await?;
        }

        self.pgmq
            .archive_in(&mut tx, &self.queue_name, received.msg_id)
            .await?;

        if options.reply_on_tsq {
            if let Some(reply_to) = &command.reply_to {
                let reply =
                    Reply::failed(command.command_id, command.correlation_id, code, message);
                self.pgmq
                    .send_in(&mut tx, reply_to, &serde_json::to_value(&reply)?, 0)
                    .await?;
                self.pgmq.notify_in(&mut tx, reply_to).await?;
            }
        }

        if let Some(batch_id) = received.metadata.batch_id {
            self.batches
                .record_outcome(
                    &command.domain,
                    batch_id,
                    BatchOutcome::InTroubleshooting,
                    Some(&mut *tx),
                )
                .await?;
        }

        tx.commit().await.map_err(StorageError::from)?;
        warn!(
            domain = %command.domain,
            command_id = %command.command_id,
            error_code = code,
            exhausted,
            "moved command to troubleshooting queue"
        );
        Ok(())
    }
}

/// Observational stuck-task detector.
///
/// Flags any dispatch task running past `visibility_timeout +
/// stuck_task_buffer`; the database statement timeout is the forcing
/// mechanism, so nothing gets killed here.
async fn watchdog_loop(inner: Arc<WorkerInner>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs_f64(
        inner.config.timeouts.watchdog_interval_s,
    ));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let threshold = Duration::from_secs_f64(inner.config.timeouts.stuck_threshold_s());

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                let in_flight = inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                for (msg_id, task) in in_flight.iter() {
                    let elapsed = now.duration_since(task.started);
                    if elapsed > threshold {
                        warn!(
                            msg_id,
                            command_id = %task.command_id,
                            command_type = %task.command_type,
                            elapsed_s = elapsed.as_secs_f64(),
                            threshold_s = threshold.as_secs_f64(),
                            "dispatch task exceeded stuck threshold"
                        );
                    }
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;

    fn dispatch(err: HandlerError) -> DispatchError {
        DispatchError::Handler(err)
    }

    #[test]
    fn test_action_for_business_rule() {
        let err = dispatch(HandlerError::business_rule("LIMIT", "over limit"));
        assert_eq!(action_for(&err), FailureAction::BusinessFailure);
    }

    #[test]
    fn test_action_for_permanent() {
        let err = dispatch(HandlerError::permanent("BAD_INPUT", "unparseable"));
        assert_eq!(action_for(&err), FailureAction::MoveToTsq);
    }

    #[test]
    fn test_action_for_transient() {
        let err = dispatch(HandlerError::transient("TIMEOUT", "slow"));
        assert_eq!(action_for(&err), FailureAction::Retry);
    }

    #[test]
    fn test_action_for_missing_handler() {
        let err = DispatchError::NotFound {
            domain: "payments".to_string(),
            command_type: "Debit".to_string(),
        };
        assert_eq!(action_for(&err), FailureAction::Retry);
        let (code, message) = error_code_of(&err);
        assert_eq!(code, HANDLER_NOT_FOUND_CODE);
        assert!(message.contains("payments.Debit"));
    }

    #[test]
    fn test_recoverable_timeout_classification() {
        let err = WorkerError::Storage(StorageError::Database(sqlx::Error::PoolTimedOut));
        assert!(is_recoverable_timeout(&err));

        let err = WorkerError::Storage(StorageError::Database(sqlx::Error::RowNotFound));
        assert!(!is_recoverable_timeout(&err));

        let err = WorkerError::AlreadyRunning;
        assert!(!is_recoverable_timeout(&err));
    }

    #[test]
    fn test_error_code_of_handler_error() {
        let err = dispatch(HandlerError::transient("TIMEOUT", "downstream slow"));
        let (code, message) = error_code_of(&err);
        assert_eq!(code, "TIMEOUT");
        assert_eq!(message, "downstream slow");
    }

    #[tokio::test]
    async fn test_worker_construction_rejects_broken_timeouts() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/commandbus_test")
            .expect("lazy pool");
        let config = WorkerConfig {
            timeouts: TimeoutConfig {
                statement_timeout_ms: 45_000,
                visibility_timeout_s: 30,
                ..Default::default()
            },
            ..WorkerConfig::for_domain("payments")
        };
        let result = Worker::new(pool, Arc::new(HandlerRegistry::new()), config);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_worker_construction_accepts_defaults() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/commandbus_test")
            .expect("lazy pool");
        let worker = Worker::new(
            pool,
            Arc::new(HandlerRegistry::new()),
            WorkerConfig::for_domain("payments"),
        )
        .unwrap();
        assert_eq!(worker.domain(), "payments");
        assert_eq!(worker.queue_name(), "payments__commands");
    }
}
