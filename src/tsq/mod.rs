//! Troubleshooting queue: operator-mediated recovery.
//!
//! Commands land here after permanent failures or retry exhaustion. Their
//! queue messages are archived, so listings join command metadata with
//! `pgmq.a_<queue>` to show the original payload. Operators can retry
//! (re-enqueue the archived payload), cancel, or complete each command;
//! every operator action is one transaction and lands in the audit trail.

use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{
    archive_table, command_queue, CommandMetadata, CommandStatus, ErrorKind, Reply,
    TroubleshootingItem,
};
use crate::pgmq::{PgmqClient, PgmqError};
use crate::storage::{
    AuditEventType, AuditLog, BatchOutcome, BatchStore, CommandStore, PostgresAuditLog,
    PostgresBatchStore, PostgresCommandStore, StorageError,
};

/// Errors from troubleshooting operations.
#[derive(Debug, thiserror::Error)]
pub enum TsqError {
    #[error("command {domain}/{command_id} not found")]
    CommandNotFound { domain: String, command_id: Uuid },

    #[error("command {domain}/{command_id} is not in the troubleshooting queue (status {status})")]
    NotInTroubleshootingQueue {
        domain: String,
        command_id: Uuid,
        status: String,
    },

    #[error("no archived payload for {domain}/{command_id}")]
    ArchivedPayloadMissing { domain: String, command_id: Uuid },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] PgmqError),

    #[error("failed to encode payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for TsqError {
    fn from(err: sqlx::Error) -> Self {
        TsqError::Storage(StorageError::Database(err))
    }
}

/// Listing query: command metadata joined with the queue's archive table.
/// The archive table name cannot be bound as a parameter, so it is
/// formatted in; queue names derive from domains, not user input.
fn list_sql(queue_name: &str, with_command_type: bool) -> String {
    let mut sql = format!(
        r#"
        SELECT c.domain, c.command_id, c.command_type, c.attempts, c.max_attempts,
               c.last_error_type, c.last_error_code, c.last_error_msg,
               c.correlation_id, c.reply_queue, a.message AS payload,
               c.created_at, c.updated_at
        FROM commandbus.command c
        LEFT JOIN {archive} a ON a.message->>'command_id' = c.command_id::text
        WHERE c.domain = $1
          AND c.status = $2
        "#,
        archive = archive_table(queue_name),
    );
    if with_command_type {
        sql.push_str(" AND c.command_type = $3");
        sql.push_str(" ORDER BY c.updated_at DESC LIMIT $4 OFFSET $5");
    } else {
        sql.push_str(" ORDER BY c.updated_at DESC LIMIT $3 OFFSET $4");
    }
    sql
}

fn row_to_item(row: &PgRow) -> Result<TroubleshootingItem, TsqError> {
    let error_kind = match row.try_get::<Option<String>, _>("last_error_type")? {
        Some(text) => Some(ErrorKind::parse(&text).ok_or(StorageError::InvalidColumn {
            column: "last_error_type",
            value: text,
        })?),
        None => None,
    };

    Ok(TroubleshootingItem {
        domain: row.try_get("domain")?,
        command_id: row.try_get("command_id")?,
        command_type: row.try_get("command_type")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        last_error_type: error_kind,
        last_error_code: row.try_get("last_error_code")?,
        last_error_msg: row.try_get("last_error_msg")?,
        correlation_id: row.try_get("correlation_id")?,
        reply_to: row.try_get("reply_queue")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Operator operations over commands awaiting troubleshooting.
pub struct TroubleshootingQueue {
    pool: PgPool,
    pgmq: PgmqClient,
    commands: Arc<dyn CommandStore>,
    audit: Arc<dyn AuditLog>,
    batches: Arc<dyn BatchStore>,
}

impl TroubleshootingQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pgmq: PgmqClient::new(pool.clone()),
            commands: Arc::new(PostgresCommandStore::new(pool.clone())),
            audit: Arc::new(PostgresAuditLog::new(pool.clone())),
            batches: Arc::new(PostgresBatchStore::new(pool.clone())),
            pool,
        }
    }

    /// Commands awaiting operator action in a domain, newest first, with
    /// their archived payloads.
    pub async fn list_troubleshooting(
        &self,
        domain: &str,
        command_type: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TroubleshootingItem>, TsqError> {
        let queue_name = command_queue(domain);
        let sql = list_sql(&queue_name, command_type.is_some());

        let rows = match command_type {
            Some(command_type) => {
                sqlx::query(&sql)
                    .bind(domain)
                    .bind(CommandStatus::InTroubleshootingQueue.as_str())
                    .bind(command_type)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(&sql)
                    .bind(domain)
                    .bind(CommandStatus::InTroubleshootingQueue.as_str())
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let items = rows
            .iter()
            .map(row_to_item)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(domain = %domain, count = items.len(), "listed troubleshooting items");
        Ok(items)
    }

    /// How many commands await operator action in a domain.
    pub async fn count_troubleshooting(
        &self,
        domain: &str,
        command_type: Option<&str>,
    ) -> Result<i64, TsqError> {
        let row = match command_type {
            Some(command_type) => {
                sqlx::query(
                    r#"
                    SELECT COUNT(*) AS total FROM commandbus.command
                    WHERE domain = $1 AND status = $2 AND command_type = $3
                    "#,
                )
                .bind(domain)
                .bind(CommandStatus::InTroubleshootingQueue.as_str())
                .bind(command_type)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT COUNT(*) AS total FROM commandbus.command
                    WHERE domain = $1 AND status = $2
                    "#,
                )
                .bind(domain)
                .bind(CommandStatus::InTroubleshootingQueue.as_str())
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(row.try_get("total")?)
    }

    /// Domains that currently have commands in troubleshooting.
    pub async fn list_domains(&self) -> Result<Vec<String>, TsqError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT domain FROM commandbus.command
            WHERE status = $1
            ORDER BY domain
            "#,
        )
        .bind(CommandStatus::InTroubleshootingQueue.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut domains = Vec::with_capacity(rows.len());
        for row in rows {
            domains.push(row.try_get("domain")?);
        }
        Ok(domains)
    }

    /// Troubleshooting items across every domain, up to `limit`.
    pub async fn list_all_troubleshooting(
        &self,
        command_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<TroubleshootingItem>, TsqError> {
        let mut items = Vec::new();
        for domain in self.list_domains().await? {
            let remaining = limit - items.len() as i64;
            if remaining <= 0 {
                break;
            }
            items.extend(
                self.list_troubleshooting(&domain, command_type, remaining, 0)
                    .await?,
            );
        }
        Ok(items)
    }

    /// Ids of troubleshooting commands in a domain, newest first.
    pub async fn list_command_ids(
        &self,
        domain: &str,
        command_type: Option<&str>,
    ) -> Result<Vec<Uuid>, TsqError> {
        let rows = match command_type {
            Some(command_type) => {
                sqlx::query(
                    r#"
                    SELECT command_id FROM commandbus.command
                    WHERE domain = $1 AND status = $2 AND command_type = $3
                    ORDER BY updated_at DESC
                    "#,
                )
                .bind(domain)
                .bind(CommandStatus::InTroubleshootingQueue.as_str())
                .bind(command_type)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT command_id FROM commandbus.command
                    WHERE domain = $1 AND status = $2
                    ORDER BY updated_at DESC
                    "#,
                )
                .bind(domain)
                .bind(CommandStatus::InTroubleshootingQueue.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get("command_id")?);
        }
        Ok(ids)
    }

    /// Find which domain holds a troubleshooting command.
    pub async fn get_command_domain(&self, command_id: Uuid) -> Result<Option<String>, TsqError> {
        let row = sqlx::query(
            r#"
            SELECT domain FROM commandbus.command
            WHERE command_id = $1 AND status = $2
            LIMIT 1
            "#,
        )
        .bind(command_id)
        .bind(CommandStatus::InTroubleshootingQueue.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("domain")?),
            None => None,
        })
    }

    /// Require troubleshooting status, returning the metadata.
    async fn require_troubleshooting(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
    ) -> Result<CommandMetadata, TsqError> {
        let meta = self
            .commands
            .fetch(domain, command_id, Some(&mut *conn))
            .await?
            .ok_or_else(|| TsqError::CommandNotFound {
                domain: domain.to_string(),
                command_id,
            })?;

        if meta.status != CommandStatus::InTroubleshootingQueue {
            return Err(TsqError::NotInTroubleshootingQueue {
                domain: domain.to_string(),
                command_id,
                status: meta.status.as_str().to_string(),
            });
        }
        Ok(meta)
    }

    /// Re-enqueue the archived payload and put the command back in play:
    /// `attempts = 0`, status `PENDING`, errors cleared, fresh `msg_id`.
    ///
    /// Returns the new message id.
    pub async fn operator_retry(
        &self,
        domain: &str,
        command_id: Uuid,
        operator: &str,
    ) -> Result<i64, TsqError> {
        let queue_name = command_queue(domain);
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        let meta = self
            .require_troubleshooting(&mut tx, domain, command_id)
            .await?;

        let row = sqlx::query(&format!(
            "SELECT message FROM {} WHERE message->>'command_id' = $1 ORDER BY msg_id DESC LIMIT 1",
            archive_table(&queue_name),
        ))
        .bind(command_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        let payload: Value = match row {
            Some(row) => row.try_get("message")?,
            None => {
                return Err(TsqError::ArchivedPayloadMissing {
                    domain: domain.to_string(),
                    command_id,
                })
            }
        };

        let msg_id = self.pgmq.send_in(&mut tx, &queue_name, &payload, 0).await?;
        self.commands
            .reset_for_retry(domain, command_id, msg_id, Some(&mut *tx))
            .await?;
        self.audit
            .log(
                domain,
                command_id,
                AuditEventType::OperatorRetry,
                Some(json!({"operator": operator, "msg_id": msg_id})),
                Some(&mut *tx),
            )
            .await?;
        if let Some(batch_id) = meta.batch_id {
            self.batches
                .release_troubleshooting(domain, batch_id, Some(&mut *tx))
                .await?;
        }
        self.pgmq.notify_in(&mut tx, &queue_name).await?;

        tx.commit().await.map_err(StorageError::from)?;
        info!(
            domain = %domain,
            command_id = %command_id,
            operator = %operator,
            msg_id,
            "operator retried command"
        );
        Ok(msg_id)
    }

    /// Cancel a troubleshooting command. A `CANCELED` reply goes out only
    /// when a producer is waiting on one.
    pub async fn operator_cancel(
        &self,
        domain: &str,
        command_id: Uuid,
        operator: &str,
        reason: Option<&str>,
    ) -> Result<(), TsqError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        let meta = self
            .require_troubleshooting(&mut tx, domain, command_id)
            .await?;

        self.commands
            .update_status(domain, command_id, CommandStatus::Canceled, Some(&mut *tx))
            .await?;

        if let Some(reply_to) = &meta.reply_to {
            let reply = Reply::canceled(command_id, meta.correlation_id);
            self.pgmq
                .send_in(&mut tx, reply_to, &serde_json::to_value(&reply)?, 0)
                .await?;
            self.pgmq.notify_in(&mut tx, reply_to).await?;
        }

        self.audit
            .log(
                domain,
                command_id,
                AuditEventType::OperatorCancel,
                Some(json!({"operator": operator, "reason": reason})),
                Some(&mut *tx),
            )
            .await?;
        if let Some(batch_id) = meta.batch_id {
            self.batches
                .release_troubleshooting(domain, batch_id, Some(&mut *tx))
                .await?;
            self.batches
                .record_outcome(domain, batch_id, BatchOutcome::Canceled, Some(&mut *tx))
                .await?;
        }

        tx.commit().await.map_err(StorageError::from)?;
        info!(
            domain = %domain,
            command_id = %command_id,
            operator = %operator,
            "operator canceled command"
        );
        Ok(())
    }

    /// Complete a troubleshooting command by hand, optionally with a
    /// result payload for the reply.
    pub async fn operator_complete(
        &self,
        domain: &str,
        command_id: Uuid,
        operator: &str,
        result_data: Option<Value>,
    ) -> Result<(), TsqError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        let meta = self
            .require_troubleshooting(&mut tx, domain, command_id)
            .await?;

        self.commands
            .update_status(domain, command_id, CommandStatus::Completed, Some(&mut *tx))
            .await?;

        let has_result = result_data.is_some();
        if let Some(reply_to) = &meta.reply_to {
            let reply = Reply::success(command_id, meta.correlation_id, result_data);
            self.pgmq
                .send_in(&mut tx, reply_to, &serde_json::to_value(&reply)?, 0)
                .await?;
            self.pgmq.notify_in(&mut tx, reply_to).await?;
        }

        self.audit
            .log(
                domain,
                command_id,
                AuditEventType::OperatorComplete,
                Some(json!({"operator": operator, "has_result": has_result})),
                Some(&mut *tx),
            )
            .await?;
        if let Some(batch_id) = meta.batch_id {
            self.batches
                .release_troubleshooting(domain, batch_id, Some(&mut *tx))
                .await?;
            self.batches
                .record_outcome(domain, batch_id, BatchOutcome::Completed, Some(&mut *tx))
                .await?;
        }

        tx.commit().await.map_err(StorageError::from)?;
        info!(
            domain = %domain,
            command_id = %command_id,
            operator = %operator,
            "operator completed command"
        );
        Ok(())
    }
}
