//! Command bus producer: idempotent sends, chunked batch sends, and
//! read-only queries.
//!
//! A send is one transaction: the metadata row, the queue row, the `SENT`
//! audit event, and the wakeup notification either all commit or none do.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sqlx::{Acquire, PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use async_trait::async_trait;

use crate::models::{
    command_queue, BatchMetadata, BatchStatus, Command, CommandMetadata,
};
use crate::pgmq::{PgmqClient, PgmqError};
use crate::storage::{
    AuditEvent, AuditEventType, AuditLog, AuditRecord, BatchStore, CommandFilter, CommandStore,
    PostgresAuditLog, PostgresBatchStore, PostgresCommandStore, StorageError,
};
use crate::utils::retry::RetryPolicy;

/// Default chunk size for batch sends, kept under typical parameter limits.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Errors surfaced by the producer.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("duplicate command {domain}/{command_id}")]
    DuplicateCommand { domain: String, command_id: Uuid },

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Queue(#[from] PgmqError),

    #[error("failed to encode payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for BusError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DuplicateCommand { domain, command_id } => {
                BusError::DuplicateCommand { domain, command_id }
            }
            other => BusError::Storage(other),
        }
    }
}

impl From<sqlx::Error> for BusError {
    fn from(err: sqlx::Error) -> Self {
        BusError::Storage(StorageError::Database(err))
    }
}

/// A request to send one command.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub domain: String,
    pub command_type: String,
    pub command_id: Uuid,
    pub data: Value,
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<String>,
    pub max_attempts: Option<i32>,
    /// Seconds before the message becomes visible.
    pub delay: i32,
    pub batch_id: Option<Uuid>,
}

impl SendRequest {
    pub fn new(domain: &str, command_type: &str, command_id: Uuid, data: Value) -> Self {
        Self {
            domain: domain.to_string(),
            command_type: command_type.to_string(),
            command_id,
            data,
            correlation_id: None,
            reply_to: None,
            max_attempts: None,
            delay: 0,
            batch_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_string());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_delay(mut self, delay: i32) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_batch_id(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }
}

/// Outcome of a successful send.
#[derive(Debug, Clone, Copy)]
pub struct SendResult {
    pub command_id: Uuid,
    pub msg_id: i64,
}

/// The sending capability, so sagas and tests can stand in for the full
/// bus.
#[async_trait]
pub trait CommandSender: Send + Sync {
    /// Send a command in its own transaction.
    async fn send(&self, request: SendRequest) -> Result<SendResult, BusError>;

    /// Send a command, joining the caller's transaction when one is given.
    async fn send_with(
        &self,
        conn: Option<&mut PgConnection>,
        request: SendRequest,
    ) -> Result<SendResult, BusError>;
}

/// The producer side of the command bus.
pub struct CommandBus {
    pool: PgPool,
    pgmq: PgmqClient,
    commands: Arc<dyn CommandStore>,
    audit: Arc<dyn AuditLog>,
    batches: Arc<dyn BatchStore>,
}

impl CommandBus {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pgmq: PgmqClient::new(pool.clone()),
            commands: Arc::new(PostgresCommandStore::new(pool.clone())),
            audit: Arc::new(PostgresAuditLog::new(pool.clone())),
            batches: Arc::new(PostgresBatchStore::new(pool.clone())),
            pool,
        }
    }

    /// Create a domain's command queue if missing. Idempotent.
    pub async fn ensure_queue(&self, domain: &str) -> Result<(), BusError> {
        self.pgmq.create_queue(&command_queue(domain)).await?;
        Ok(())
    }

    /// Create a reply queue if missing. Idempotent.
    pub async fn ensure_reply_queue(&self, queue_name: &str) -> Result<(), BusError> {
        self.pgmq.create_queue(queue_name).await?;
        Ok(())
    }

    /// Send a command on an existing connection; the caller owns commit.
    async fn send_on(
        &self,
        conn: &mut PgConnection,
        request: SendRequest,
    ) -> Result<SendResult, BusError> {
        let correlation_id = request.correlation_id.unwrap_or_else(Uuid::new_v4);
        let max_attempts = request
            .max_attempts
            .unwrap_or(RetryPolicy::default().max_attempts);

        let command = Command {
            domain: request.domain.clone(),
            command_type: request.command_type.clone(),
            command_id: request.command_id,
            data: request.data.clone(),
            correlation_id: Some(correlation_id),
            reply_to: request.reply_to.clone(),
            created_at: Utc::now(),
        };
        let meta = CommandMetadata::new(&command, max_attempts, request.batch_id);

        self.commands.insert(&meta, Some(&mut *conn)).await?;

        let envelope = serde_json::to_value(&command)?;
        let msg_id = self
            .pgmq
            .send_in(&mut *conn, &meta.queue_name, &envelope, request.delay)
            .await?;
        self.commands
            .update_msg_id(&meta.domain, meta.command_id, msg_id, Some(&mut *conn))
            .await?;

        self.audit
            .log(
                &meta.domain,
                meta.command_id,
                AuditEventType::Sent,
                Some(serde_json::json!({
                    "command_type": meta.command_type,
                    "correlation_id": correlation_id,
                    "reply_to": meta.reply_to,
                    "max_attempts": max_attempts,
                })),
                Some(&mut *conn),
            )
            .await?;

        self.pgmq.notify_in(&mut *conn, &meta.queue_name).await?;

        debug!(
            domain = %meta.domain,
            command_type = %meta.command_type,
            command_id = %meta.command_id,
            msg_id,
            "sent command"
        );
        Ok(SendResult {
            command_id: meta.command_id,
            msg_id,
        })
    }

    /// Send many commands, one transaction per chunk.
    ///
    /// Requests are grouped by domain and chunked to respect parameter
    /// limits. A duplicate inside a chunk fails only its own entry; the
    /// rest of the chunk still commits. Results come back in input order.
    pub async fn send_batch(
        &self,
        requests: Vec<SendRequest>,
        chunk_size: usize,
    ) -> Result<Vec<Result<SendResult, BusError>>, BusError> {
        let chunk_size = chunk_size.max(1);
        let mut results: Vec<Option<Result<SendResult, BusError>>> =
            requests.iter().map(|_| None).collect();

        for chunk in chunk_by_domain(&requests, chunk_size) {
            let mut tx = self.pool.begin().await?;
            let mut accepted: Vec<usize> = Vec::with_capacity(chunk.len());
            let mut commands: Vec<Command> = Vec::with_capacity(chunk.len());

            for &index in &chunk {
                let request = &requests[index];
                let correlation_id = request.correlation_id.unwrap_or_else(Uuid::new_v4);
                let max_attempts = request
                    .max_attempts
                    .unwrap_or(RetryPolicy::default().max_attempts);
                let command = Command {
                    domain: request.domain.clone(),
                    command_type: request.command_type.clone(),
                    command_id: request.command_id,
                    data: request.data.clone(),
                    correlation_id: Some(correlation_id),
                    reply_to: request.reply_to.clone(),
                    created_at: Utc::now(),
                };
                let meta = CommandMetadata::new(&command, max_attempts, request.batch_id);

                // Savepoint per insert: a duplicate aborts only this entry.
                let mut savepoint = tx.begin().await?;
                match self.commands.insert(&meta, Some(&mut *savepoint)).await {
                    Ok(()) => {
                        savepoint.commit().await?;
                        accepted.push(index);
                        commands.push(command);
                    }
                    Err(err) => {
                        savepoint.rollback().await?;
                        results[index] = Some(Err(err.into()));
                    }
                }
            }

            if accepted.is_empty() {
                tx.commit().await?;
                continue;
            }

            let queue_name = command_queue(&requests[accepted[0]].domain);

            // One pgmq.send_batch per distinct delay, preserving order.
            let mut by_delay: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
            for (position, &index) in accepted.iter().enumerate() {
                by_delay
                    .entry(requests[index].delay)
                    .or_default()
                    .push(position);
            }

            let mut msg_ids: Vec<i64> = vec![0; accepted.len()];
            for (delay, positions) in by_delay {
                let mut envelopes = Vec::with_capacity(positions.len());
                for &position in &positions {
                    envelopes.push(serde_json::to_value(&commands[position])?);
                }
                let ids = self
                    .pgmq
                    .send_batch_in(&mut tx, &queue_name, &envelopes, delay)
                    .await?;
                for (&position, id) in positions.iter().zip(ids) {
                    msg_ids[position] = id;
                }
            }

            let mut audit_records = Vec::with_capacity(accepted.len());
            for (position, &index) in accepted.iter().enumerate() {
                let command = &commands[position];
                let msg_id = msg_ids[position];
                self.commands
                    .update_msg_id(&command.domain, command.command_id, msg_id, Some(&mut *tx))
                    .await?;
                audit_records.push(AuditRecord {
                    domain: command.domain.clone(),
                    command_id: command.command_id,
                    event_type: AuditEventType::Sent,
                    details: Some(serde_json::json!({
                        "command_type": command.command_type,
                        "correlation_id": command.correlation_id,
                        "reply_to": command.reply_to,
                        "max_attempts": requests[index]
                            .max_attempts
                            .unwrap_or(RetryPolicy::default().max_attempts),
                    })),
                });
                results[index] = Some(Ok(SendResult {
                    command_id: command.command_id,
                    msg_id,
                }));
            }
            self.audit.log_batch(&audit_records, &mut tx).await?;
            self.pgmq.notify_in(&mut tx, &queue_name).await?;

            tx.commit().await?;
            info!(
                queue = %queue_name,
                sent = accepted.len(),
                rejected = chunk.len() - accepted.len(),
                "sent command chunk"
            );
        }

        Ok(results
            .into_iter()
            .map(|result| result.expect("every request resolves to a result"))
            .collect())
    }

    /// Create a batch record and send its commands.
    ///
    /// Returns the batch id plus per-request outcomes. The batch row moves
    /// to `IN_PROGRESS` once the sends are done; outcome counters fill in
    /// as the worker and operators finish individual commands.
    pub async fn create_batch(
        &self,
        domain: &str,
        name: &str,
        custom_data: Option<Value>,
        mut requests: Vec<SendRequest>,
        chunk_size: usize,
    ) -> Result<(Uuid, Vec<Result<SendResult, BusError>>), BusError> {
        let batch_id = Uuid::new_v4();
        let batch = BatchMetadata::new(domain, batch_id, name, custom_data, requests.len() as i32);
        self.batches.save(&batch, None).await?;

        for request in &mut requests {
            request.domain = domain.to_string();
            request.batch_id = Some(batch_id);
        }

        let results = self.send_batch(requests, chunk_size).await?;
        self.batches.mark_started(domain, batch_id, None).await?;
        Ok((batch_id, results))
    }

    pub async fn get_batch(
        &self,
        domain: &str,
        batch_id: Uuid,
    ) -> Result<Option<BatchMetadata>, BusError> {
        Ok(self.batches.get(domain, batch_id, None).await?)
    }

    pub async fn list_batches(
        &self,
        domain: &str,
        status: Option<BatchStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<BatchMetadata>, BusError> {
        Ok(self.batches.list(domain, status, limit, offset, None).await?)
    }

    pub async fn get_command(
        &self,
        domain: &str,
        command_id: Uuid,
    ) -> Result<Option<CommandMetadata>, BusError> {
        Ok(self.commands.fetch(domain, command_id, None).await?)
    }

    pub async fn query_commands(
        &self,
        filter: &CommandFilter,
    ) -> Result<Vec<CommandMetadata>, BusError> {
        Ok(self.commands.query(filter, None).await?)
    }

    /// Audit events for a command, oldest first.
    pub async fn get_audit_trail(
        &self,
        domain: &str,
        command_id: Uuid,
    ) -> Result<Vec<AuditEvent>, BusError> {
        Ok(self.audit.events(Some(domain), command_id, None).await?)
    }
}

#[async_trait]
impl CommandSender for CommandBus {
    async fn send(&self, request: SendRequest) -> Result<SendResult, BusError> {
        let mut tx = self.pool.begin().await?;
        let result = self.send_on(&mut tx, request).await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn send_with(
        &self,
        conn: Option<&mut PgConnection>,
        request: SendRequest,
    ) -> Result<SendResult, BusError> {
        match conn {
            Some(conn) => self.send_on(conn, request).await,
            None => self.send(request).await,
        }
    }
}

/// Group request indices by domain, then split into chunks. Input order is
/// preserved within each domain.
fn chunk_by_domain(requests: &[SendRequest], chunk_size: usize) -> Vec<Vec<usize>> {
    let mut by_domain: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, request) in requests.iter().enumerate() {
        by_domain.entry(&request.domain).or_default().push(index);
    }

    let mut chunks = Vec::new();
    for (_, indices) in by_domain {
        for chunk in indices.chunks(chunk_size) {
            chunks.push(chunk.to_vec());
        }
    }
    chunks
}
