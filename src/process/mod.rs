//! Process managers: multi-step sagas coordinated over commands and
//! replies.
//!
//! A process is identified by `process_id`, which doubles as the
//! `correlation_id` of every command it sends. Concrete sagas implement
//! [`ProcessDefinition`] with a typed state and a step enum; the
//! [`ProcessManager`] engine owns persistence, reply handling, and the
//! compensation walk. The [`router`] module consumes the shared reply
//! queue and dispatches to the registered managers.

pub mod router;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BusError, CommandSender, SendRequest};
use crate::models::{Reply, ReplyOutcome};
use crate::pgmq::PgmqError;
use crate::storage::{ProcessStore, StorageError};

pub use router::{ProcessReplyRouter, RouterOptions};

/// Status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Pending,
    InProgress,
    WaitingForReply,
    Completed,
    Canceled,
    Compensated,
    WaitingForTsq,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Pending => "PENDING",
            ProcessStatus::InProgress => "IN_PROGRESS",
            ProcessStatus::WaitingForReply => "WAITING_FOR_REPLY",
            ProcessStatus::Completed => "COMPLETED",
            ProcessStatus::Canceled => "CANCELED",
            ProcessStatus::Compensated => "COMPENSATED",
            ProcessStatus::WaitingForTsq => "WAITING_FOR_TSQ",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ProcessStatus::Pending),
            "IN_PROGRESS" => Some(ProcessStatus::InProgress),
            "WAITING_FOR_REPLY" => Some(ProcessStatus::WaitingForReply),
            "COMPLETED" => Some(ProcessStatus::Completed),
            "CANCELED" => Some(ProcessStatus::Canceled),
            "COMPENSATED" => Some(ProcessStatus::Compensated),
            "WAITING_FOR_TSQ" => Some(ProcessStatus::WaitingForTsq),
            _ => None,
        }
    }
}

/// Persisted saga record. `state` is opaque JSON owned by the definition.
#[derive(Debug, Clone)]
pub struct ProcessMetadata {
    pub domain: String,
    pub process_id: Uuid,
    pub process_type: String,
    pub status: ProcessStatus,
    pub current_step: Option<String>,
    pub state: Value,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessMetadata {
    pub fn new(domain: &str, process_id: Uuid, process_type: &str, state: Value) -> Self {
        let now = Utc::now();
        Self {
            domain: domain.to_string(),
            process_id,
            process_type: process_type.to_string(),
            status: ProcessStatus::Pending,
            current_step: None,
            state,
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// A stored per-step audit entry.
#[derive(Debug, Clone)]
pub struct ProcessAuditEntry {
    pub entry_id: i64,
    pub domain: String,
    pub process_id: Uuid,
    pub step_name: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub command_data: Option<Value>,
    pub sent_at: DateTime<Utc>,
    pub reply_outcome: Option<ReplyOutcome>,
    pub reply_data: Option<Value>,
    pub received_at: Option<DateTime<Utc>>,
}

/// Input for appending a step audit entry.
#[derive(Debug, Clone)]
pub struct NewProcessAuditEntry {
    pub domain: String,
    pub process_id: Uuid,
    pub step_name: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub command_data: Option<Value>,
}

/// The command a step sends.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub command_type: String,
    pub data: Value,
}

impl ProcessCommand {
    pub fn new(command_type: &str, data: Value) -> Self {
        Self {
            command_type: command_type.to_string(),
            data,
        }
    }
}

/// Step identity for a saga.
///
/// Steps are enums with stable names; the name is what gets persisted in
/// the process audit, and parsing it back drives the compensation walk.
pub trait ProcessStep: Copy + Eq + Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn from_name(name: &str) -> Option<Self>
    where
        Self: Sized;
}

/// Errors from process management.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] PgmqError),

    #[error("failed to (de)serialize process state: {0}")]
    State(#[from] serde_json::Error),

    #[error("unknown step '{name}' for process {process_id}")]
    UnknownStep { process_id: Uuid, name: String },

    #[error("process {process_id} is waiting with no current step")]
    NoCurrentStep { process_id: Uuid },

    #[error("reply router is already running")]
    RouterAlreadyRunning,
}

/// A concrete saga: its state, steps, and transition table.
#[async_trait]
pub trait ProcessDefinition: Send + Sync + 'static {
    type State: Serialize + DeserializeOwned + Send + Sync;
    type Step: ProcessStep;

    fn process_type(&self) -> &str;
    fn domain(&self) -> &str;

    /// Build the initial state from the caller-supplied payload.
    fn create_initial_state(&self, initial: &Value) -> Result<Self::State, ProcessError>;

    fn first_step(&self, state: &Self::State) -> Self::Step;

    /// The command a step sends.
    async fn build_command(
        &self,
        step: Self::Step,
        state: &Self::State,
    ) -> Result<ProcessCommand, ProcessError>;

    /// Fold a successful reply into the state.
    fn update_state(&self, state: &mut Self::State, step: Self::Step, reply: &Reply);

    /// The step after `current`, or `None` when the saga is done.
    fn next_step(
        &self,
        current: Self::Step,
        reply: &Reply,
        state: &Self::State,
    ) -> Option<Self::Step>;

    /// The compensating step for a completed step, if it has one.
    fn compensation_step(&self, step: Self::Step) -> Option<Self::Step>;
}

/// Object-safe view of a process manager, so the reply router can hold
/// managers for heterogeneous definitions.
#[async_trait]
pub trait DynProcessManager: Send + Sync {
    fn process_type(&self) -> &str;

    async fn handle_reply(
        &self,
        conn: Option<&mut PgConnection>,
        reply: &Reply,
        meta: &mut ProcessMetadata,
    ) -> Result<(), ProcessError>;
}

/// Saga engine for one [`ProcessDefinition`].
///
/// Owns persistence and command emission; the definition stays a pure
/// transition table.
pub struct ProcessManager<D: ProcessDefinition> {
    definition: D,
    bus: Arc<dyn CommandSender>,
    store: Arc<dyn ProcessStore>,
    reply_queue: String,
    pool: PgPool,
}

impl<D: ProcessDefinition> ProcessManager<D> {
    pub fn new(
        definition: D,
        bus: Arc<dyn CommandSender>,
        store: Arc<dyn ProcessStore>,
        reply_queue: &str,
        pool: PgPool,
    ) -> Self {
        Self {
            definition,
            bus,
            store,
            reply_queue: reply_queue.to_string(),
            pool,
        }
    }

    pub fn definition(&self) -> &D {
        &self.definition
    }

    /// Start a new process in its own transaction.
    pub async fn start(&self, initial: Value) -> Result<Uuid, ProcessError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
        let process_id = self.start_with(Some(&mut *tx), initial).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(process_id)
    }

    /// Start a new process, optionally on a caller-supplied connection.
    ///
    /// Persists the initial state, sends the first step's command with
    /// `correlation_id = process_id`, and leaves the process in
    /// `WAITING_FOR_REPLY`.
    pub async fn start_with(
        &self,
        mut conn: Option<&mut PgConnection>,
        initial: Value,
    ) -> Result<Uuid, ProcessError> {
        let process_id = Uuid::new_v4();
        let state = self.definition.create_initial_state(&initial)?;
        let mut meta = ProcessMetadata::new(
            self.definition.domain(),
            process_id,
            self.definition.process_type(),
            serde_json::to_value(&state)?,
        );
        self.store.save(&meta, conn.as_deref_mut()).await?;

        let step = self.definition.first_step(&state);
        self.send_step(conn.as_deref_mut(), &mut meta, step, &state)
            .await?;

        meta.status = ProcessStatus::WaitingForReply;
        meta.updated_at = Utc::now();
        self.store.update(&meta, conn.as_deref_mut()).await?;

        debug!(
            process_id = %process_id,
            process_type = %self.definition.process_type(),
            step = step.name(),
            "started process"
        );
        Ok(process_id)
    }

    /// Apply a routed reply to a process.
    ///
    /// On `SUCCESS` the state advances and either the next step's command
    /// goes out or the process completes. `FAILED` and `CANCELED` run the
    /// compensation walk; the final status is `CANCELED` for business
    /// failures and `COMPENSATED` for cancellations.
    pub async fn handle_reply(
        &self,
        mut conn: Option<&mut PgConnection>,
        reply: &Reply,
        meta: &mut ProcessMetadata,
    ) -> Result<(), ProcessError> {
        let mut state: D::State = serde_json::from_value(meta.state.clone())?;
        let now = Utc::now();

        match reply.outcome {
            ReplyOutcome::Success => {
                let step_name =
                    meta.current_step
                        .clone()
                        .ok_or_else(|| ProcessError::NoCurrentStep {
                            process_id: meta.process_id,
                        })?;
                let step = D::Step::from_name(&step_name).ok_or_else(|| {
                    ProcessError::UnknownStep {
                        process_id: meta.process_id,
                        name: step_name.clone(),
                    }
                })?;

                self.definition.update_state(&mut state, step, reply);
                self.store
                    .record_reply(
                        &meta.domain,
                        meta.process_id,
                        &step_name,
                        ReplyOutcome::Success,
                        reply.data.as_ref(),
                        conn.as_deref_mut(),
                    )
                    .await?;

                match self.definition.next_step(step, reply, &state) {
                    Some(next) => {
                        self.send_step(conn.as_deref_mut(), meta, next, &state)
                            .await?;
                        meta.status = ProcessStatus::WaitingForReply;
                    }
                    None => {
                        meta.status = ProcessStatus::Completed;
                        meta.completed_at = Some(now);
                        debug!(process_id = %meta.process_id, "process completed");
                    }
                }
            }
            ReplyOutcome::Failed => {
                self.record_step_reply(conn.as_deref_mut(), meta, ReplyOutcome::Failed, reply)
                    .await?;
                self.compensate(conn.as_deref_mut(), meta, &state).await?;
                meta.status = ProcessStatus::Canceled;
                meta.error_code = reply.error_code.clone();
                meta.error_message = reply.error_message.clone();
                meta.completed_at = Some(now);
            }
            ReplyOutcome::Canceled => {
                self.record_step_reply(conn.as_deref_mut(), meta, ReplyOutcome::Canceled, reply)
                    .await?;
                self.compensate(conn.as_deref_mut(), meta, &state).await?;
                meta.status = ProcessStatus::Compensated;
                meta.completed_at = Some(now);
            }
        }

        meta.state = serde_json::to_value(&state)?;
        meta.updated_at = now;
        self.store.update(meta, conn.as_deref_mut()).await?;
        Ok(())
    }

    async fn record_step_reply(
        &self,
        conn: Option<&mut PgConnection>,
        meta: &ProcessMetadata,
        outcome: ReplyOutcome,
        reply: &Reply,
    ) -> Result<(), ProcessError> {
        if let Some(step_name) = &meta.current_step {
            self.store
                .record_reply(
                    &meta.domain,
                    meta.process_id,
                    step_name,
                    outcome,
                    reply.data.as_ref(),
                    conn,
                )
                .await?;
        }
        Ok(())
    }

    /// Send the command for a step and append its audit entry.
    async fn send_step(
        &self,
        mut conn: Option<&mut PgConnection>,
        meta: &mut ProcessMetadata,
        step: D::Step,
        state: &D::State,
    ) -> Result<(), ProcessError> {
        let command = self.definition.build_command(step, state).await?;
        let command_id = Uuid::new_v4();

        let request = SendRequest::new(
            self.definition.domain(),
            &command.command_type,
            command_id,
            command.data.clone(),
        )
        .with_correlation_id(meta.process_id)
        .with_reply_to(&self.reply_queue);
        self.bus.send_with(conn.as_deref_mut(), request).await?;

        self.store
            .append_step(
                &NewProcessAuditEntry {
                    domain: meta.domain.clone(),
                    process_id: meta.process_id,
                    step_name: step.name().to_string(),
                    command_id,
                    command_type: command.command_type.clone(),
                    command_data: Some(command.data),
                },
                conn.as_deref_mut(),
            )
            .await?;

        meta.current_step = Some(step.name().to_string());
        Ok(())
    }

    /// Send compensation commands for completed steps, most recent first.
    ///
    /// Compensations are fire-and-forget: they carry the process id as
    /// correlation but no reply queue.
    async fn compensate(
        &self,
        mut conn: Option<&mut PgConnection>,
        meta: &ProcessMetadata,
        state: &D::State,
    ) -> Result<(), ProcessError> {
        let steps = self
            .store
            .completed_steps(&meta.domain, meta.process_id, conn.as_deref_mut())
            .await?;

        for step_name in steps {
            let Some(step) = D::Step::from_name(&step_name) else {
                warn!(
                    process_id = %meta.process_id,
                    step = %step_name,
                    "skipping compensation for unknown step"
                );
                continue;
            };
            let Some(compensation) = self.definition.compensation_step(step) else {
                continue;
            };

            let command = self.definition.build_command(compensation, state).await?;
            let request = SendRequest::new(
                self.definition.domain(),
                &command.command_type,
                Uuid::new_v4(),
                command.data,
            )
            .with_correlation_id(meta.process_id);
            self.bus.send_with(conn.as_deref_mut(), request).await?;

            debug!(
                process_id = %meta.process_id,
                step = %step_name,
                compensation = compensation.name(),
                "sent compensation command"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<D: ProcessDefinition> DynProcessManager for ProcessManager<D> {
    fn process_type(&self) -> &str {
        self.definition.process_type()
    }

    async fn handle_reply(
        &self,
        conn: Option<&mut PgConnection>,
        reply: &Reply,
        meta: &mut ProcessMetadata,
    ) -> Result<(), ProcessError> {
        ProcessManager::handle_reply(self, conn, reply, meta).await
    }
}
