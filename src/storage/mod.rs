//! Storage: capability traits and their PostgreSQL implementations.
//!
//! This module contains:
//! - `CommandStore` / `AuditLog` / `ProcessStore` / `BatchStore` traits
//! - `StorageError` and error-classification helpers
//! - The audit event vocabulary
//! - A pool builder that applies the timeout hierarchy
//!
//! Every trait method accepts an optional connection so callers can bundle
//! several writes into one transaction; with `None` the implementation
//! acquires its own connection from the pool.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgConnection, PgPool};
use uuid::Uuid;

use crate::config::TimeoutConfig;
use crate::models::{BatchMetadata, BatchStatus, CommandMetadata, CommandStatus, ErrorKind, ReplyOutcome};
use crate::process::{NewProcessAuditEntry, ProcessAuditEntry, ProcessMetadata};

pub mod mock;
pub mod postgres;
pub mod schema;
pub mod setup;

pub use mock::MemoryProcessStore;
pub use postgres::{PostgresAuditLog, PostgresBatchStore, PostgresCommandStore, PostgresProcessStore};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("duplicate command {domain}/{command_id}")]
    DuplicateCommand { domain: String, command_id: Uuid },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid {column} value '{value}'")]
    InvalidColumn { column: &'static str, value: String },
}

/// PostgreSQL unique-constraint violation (SQLSTATE 23505).
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Statement-timeout cancellation (SQLSTATE 57014).
pub fn is_query_canceled(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("57014"))
}

/// Pool acquire timeout.
pub fn is_pool_timeout(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::PoolTimedOut)
}

/// Recoverable timeout of either kind: the message is left to visibility
/// timeout expiry and the next attempt proceeds.
pub fn is_timeout_error(err: &sqlx::Error) -> bool {
    is_query_canceled(err) || is_pool_timeout(err)
}

/// Build a connection pool honoring the timeout hierarchy.
///
/// Every session gets the configured `statement_timeout` so no SQL issued
/// through this pool can outlive a claimed message's visibility window.
pub async fn connect_pool(
    database_url: &str,
    timeouts: &TimeoutConfig,
    max_connections: u32,
) -> Result<PgPool> {
    let statement_timeout_ms = timeouts.statement_timeout_ms;
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs_f64(timeouts.pool_timeout_s))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                // Plain string execute: SET cannot go through a prepared
                // statement.
                conn.execute(format!("SET statement_timeout = {statement_timeout_ms}").as_str())
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Types of audit events recorded for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    Sent,
    Received,
    Started,
    Completed,
    Failed,
    RetryScheduled,
    RetryExhausted,
    MovedToTsq,
    OperatorRetry,
    OperatorCancel,
    OperatorComplete,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Sent => "SENT",
            AuditEventType::Received => "RECEIVED",
            AuditEventType::Started => "STARTED",
            AuditEventType::Completed => "COMPLETED",
            AuditEventType::Failed => "FAILED",
            AuditEventType::RetryScheduled => "RETRY_SCHEDULED",
            AuditEventType::RetryExhausted => "RETRY_EXHAUSTED",
            AuditEventType::MovedToTsq => "MOVED_TO_TSQ",
            AuditEventType::OperatorRetry => "OPERATOR_RETRY",
            AuditEventType::OperatorCancel => "OPERATOR_CANCEL",
            AuditEventType::OperatorComplete => "OPERATOR_COMPLETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SENT" => Some(AuditEventType::Sent),
            "RECEIVED" => Some(AuditEventType::Received),
            "STARTED" => Some(AuditEventType::Started),
            "COMPLETED" => Some(AuditEventType::Completed),
            "FAILED" => Some(AuditEventType::Failed),
            "RETRY_SCHEDULED" => Some(AuditEventType::RetryScheduled),
            "RETRY_EXHAUSTED" => Some(AuditEventType::RetryExhausted),
            "MOVED_TO_TSQ" => Some(AuditEventType::MovedToTsq),
            "OPERATOR_RETRY" => Some(AuditEventType::OperatorRetry),
            "OPERATOR_CANCEL" => Some(AuditEventType::OperatorCancel),
            "OPERATOR_COMPLETE" => Some(AuditEventType::OperatorComplete),
            _ => None,
        }
    }
}

/// A stored audit event.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub audit_id: i64,
    pub domain: String,
    pub command_id: Uuid,
    pub event_type: AuditEventType,
    pub ts: DateTime<Utc>,
    pub details: Option<Value>,
}

/// Input for a single audit append, used by the batched form.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub domain: String,
    pub command_id: Uuid,
    pub event_type: AuditEventType,
    pub details: Option<Value>,
}

/// Filter for command metadata queries.
///
/// Results are ordered `created_at DESC` with a `command_id` tie-breaker
/// so pagination stays stable.
#[derive(Debug, Clone)]
pub struct CommandFilter {
    pub status: Option<CommandStatus>,
    pub domain: Option<String>,
    pub command_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: u64,
    pub offset: u64,
}

impl Default for CommandFilter {
    fn default() -> Self {
        Self {
            status: None,
            domain: None,
            command_type: None,
            created_after: None,
            created_before: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl CommandFilter {
    pub fn with_status(mut self, status: CommandStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    pub fn with_command_type(mut self, command_type: &str) -> Self {
        self.command_type = Some(command_type.to_string());
        self
    }
}

/// Per-command metadata persistence.
///
/// `increment_attempts` is the sole writer of the attempts counter; the
/// one exception is `reset_for_retry`, which zeroes it when an operator
/// re-enqueues a command.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Insert fresh metadata. Fails with [`StorageError::DuplicateCommand`]
    /// when `(domain, command_id)` already exists.
    async fn insert(
        &self,
        meta: &CommandMetadata,
        conn: Option<&mut PgConnection>,
    ) -> Result<()>;

    async fn fetch(
        &self,
        domain: &str,
        command_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Option<CommandMetadata>>;

    async fn exists(
        &self,
        domain: &str,
        command_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<bool>;

    async fn update_status(
        &self,
        domain: &str,
        command_id: Uuid,
        status: CommandStatus,
        conn: Option<&mut PgConnection>,
    ) -> Result<()>;

    async fn update_msg_id(
        &self,
        domain: &str,
        command_id: Uuid,
        msg_id: i64,
        conn: Option<&mut PgConnection>,
    ) -> Result<()>;

    /// Atomically bump the attempts counter and return the new value.
    async fn increment_attempts(
        &self,
        domain: &str,
        command_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<i32>;

    async fn record_error(
        &self,
        domain: &str,
        command_id: Uuid,
        kind: ErrorKind,
        code: &str,
        message: &str,
        conn: Option<&mut PgConnection>,
    ) -> Result<()>;

    /// Operator retry: back to `PENDING` with `attempts = 0`, cleared
    /// errors, and the freshly assigned message id.
    async fn reset_for_retry(
        &self,
        domain: &str,
        command_id: Uuid,
        msg_id: i64,
        conn: Option<&mut PgConnection>,
    ) -> Result<()>;

    async fn query(
        &self,
        filter: &CommandFilter,
        conn: Option<&mut PgConnection>,
    ) -> Result<Vec<CommandMetadata>>;
}

/// Append-only audit log. Never updates or deletes.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn log(
        &self,
        domain: &str,
        command_id: Uuid,
        event_type: AuditEventType,
        details: Option<Value>,
        conn: Option<&mut PgConnection>,
    ) -> Result<()>;

    /// Batched append for hot paths; runs on the caller's transaction.
    async fn log_batch(&self, records: &[AuditRecord], conn: &mut PgConnection) -> Result<()>;

    /// Events for a command, oldest first.
    async fn events(
        &self,
        domain: Option<&str>,
        command_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Vec<AuditEvent>>;
}

/// Saga state persistence.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn save(
        &self,
        process: &ProcessMetadata,
        conn: Option<&mut PgConnection>,
    ) -> Result<()>;

    async fn get(
        &self,
        domain: &str,
        process_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Option<ProcessMetadata>>;

    /// Lookup by process id alone; reply routing only has the
    /// correlation id.
    async fn get_by_id(
        &self,
        process_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Option<ProcessMetadata>>;

    async fn update(
        &self,
        process: &ProcessMetadata,
        conn: Option<&mut PgConnection>,
    ) -> Result<()>;

    /// Append the audit entry for a freshly sent step command.
    async fn append_step(
        &self,
        entry: &NewProcessAuditEntry,
        conn: Option<&mut PgConnection>,
    ) -> Result<()>;

    /// Record the reply on the most recent audit entry for a step.
    async fn record_reply(
        &self,
        domain: &str,
        process_id: Uuid,
        step_name: &str,
        outcome: ReplyOutcome,
        reply_data: Option<&Value>,
        conn: Option<&mut PgConnection>,
    ) -> Result<()>;

    /// Names of steps that received a `SUCCESS` reply, most recent first.
    /// This is the compensation walk order.
    async fn completed_steps(
        &self,
        domain: &str,
        process_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Vec<String>>;

    /// All audit entries for a process, oldest first.
    async fn entries(
        &self,
        domain: &str,
        process_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Vec<ProcessAuditEntry>>;
}

/// Which outcome counter a finished command contributes to its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    Canceled,
    InTroubleshooting,
}

/// Batch metadata persistence with materialized outcome counters.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn save(&self, batch: &BatchMetadata, conn: Option<&mut PgConnection>) -> Result<()>;

    async fn get(
        &self,
        domain: &str,
        batch_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Option<BatchMetadata>>;

    async fn exists(
        &self,
        domain: &str,
        batch_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<bool>;

    async fn list(
        &self,
        domain: &str,
        status: Option<BatchStatus>,
        limit: u64,
        offset: u64,
        conn: Option<&mut PgConnection>,
    ) -> Result<Vec<BatchMetadata>>;

    /// Transition `PENDING → IN_PROGRESS` and stamp `started_at`.
    async fn mark_started(
        &self,
        domain: &str,
        batch_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<()>;

    /// Bump one outcome counter; the batch completes when the counters
    /// reach `total_count`.
    async fn record_outcome(
        &self,
        domain: &str,
        batch_id: Uuid,
        outcome: BatchOutcome,
        conn: Option<&mut PgConnection>,
    ) -> Result<()>;

    /// Undo one `InTroubleshooting` contribution after an operator retry
    /// puts the command back in flight.
    async fn release_troubleshooting(
        &self,
        domain: &str,
        batch_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_type_round_trip() {
        for event_type in [
            AuditEventType::Sent,
            AuditEventType::Received,
            AuditEventType::Started,
            AuditEventType::Completed,
            AuditEventType::Failed,
            AuditEventType::RetryScheduled,
            AuditEventType::RetryExhausted,
            AuditEventType::MovedToTsq,
            AuditEventType::OperatorRetry,
            AuditEventType::OperatorCancel,
            AuditEventType::OperatorComplete,
        ] {
            assert_eq!(AuditEventType::parse(event_type.as_str()), Some(event_type));
        }
        assert_eq!(AuditEventType::parse("NOPE"), None);
    }

    #[test]
    fn test_pool_timeout_classification() {
        let err = sqlx::Error::PoolTimedOut;
        assert!(is_pool_timeout(&err));
        assert!(is_timeout_error(&err));
        assert!(!is_query_canceled(&err));
        assert!(!is_unique_violation(&err));
    }

    #[test]
    fn test_row_not_found_is_not_timeout() {
        let err = sqlx::Error::RowNotFound;
        assert!(!is_timeout_error(&err));
        assert!(!is_unique_violation(&err));
    }

    #[test]
    fn test_filter_defaults() {
        let filter = CommandFilter::default();
        assert_eq!(filter.limit, 50);
        assert_eq!(filter.offset, 0);
        assert!(filter.status.is_none());

        let filter = CommandFilter::default()
            .with_status(CommandStatus::Pending)
            .with_domain("payments")
            .with_command_type("Debit");
        assert_eq!(filter.status, Some(CommandStatus::Pending));
        assert_eq!(filter.domain.as_deref(), Some("payments"));
        assert_eq!(filter.command_type.as_deref(), Some("Debit"));
    }
}
