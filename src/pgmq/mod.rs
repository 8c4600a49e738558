//! Typed wrapper over PGMQ queue primitives.
//!
//! Exposes the `pgmq.*` SQL functions (send, read, delete, archive,
//! set_vt) with transaction-aware variants, plus the NOTIFY/LISTEN
//! plumbing used by workers and reply routers for low-latency wakeups.
//!
//! The driver does not interpret payloads beyond JSON encoding; callers
//! own the envelope shape.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgListener;
use sqlx::{PgConnection, PgPool, Row};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Prefix for per-queue notification channels.
pub const NOTIFY_CHANNEL_PREFIX: &str = "pgmq_notify_";

/// Notification channel for a queue: `pgmq_notify_<queue_name>`.
pub fn notify_channel(queue_name: &str) -> String {
    format!("{}{}", NOTIFY_CHANNEL_PREFIX, queue_name)
}

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum PgmqError {
    #[error("queue operation failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue '{queue}' returned no row for {operation}")]
    NoResult { queue: String, operation: &'static str },
}

/// A message read from a PGMQ queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    /// Message id assigned by PGMQ.
    pub msg_id: i64,
    /// How many times this message has been read.
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Deadline until which the message stays invisible to other readers.
    pub vt: DateTime<Utc>,
    /// The JSON payload.
    pub message: Value,
}

/// Client for PGMQ queues.
///
/// Every operation has a pool-backed form and an `_in` form that runs on a
/// caller-supplied connection, so producers can bundle queue writes with
/// their own transactional work.
#[derive(Clone)]
pub struct PgmqClient {
    pool: PgPool,
}

impl PgmqClient {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a queue if it does not exist. Idempotent.
    pub async fn create_queue(&self, queue_name: &str) -> Result<(), PgmqError> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        debug!(queue = %queue_name, "created queue");
        Ok(())
    }

    /// Send a message, acquiring a connection from the pool.
    pub async fn send(&self, queue_name: &str, message: &Value, delay: i32) -> Result<i64, PgmqError> {
        let mut conn = self.pool.acquire().await?;
        self.send_in(&mut conn, queue_name, message, delay).await
    }

    /// Send a message on an existing connection.
    pub async fn send_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        message: &Value,
        delay: i32,
    ) -> Result<i64, PgmqError> {
        let row = sqlx::query("SELECT pgmq.send($1, $2::jsonb, $3) AS msg_id")
            .bind(queue_name)
            .bind(message)
            .bind(delay)
            .fetch_optional(&mut *conn)
            .await?;

        let row = row.ok_or_else(|| PgmqError::NoResult {
            queue: queue_name.to_string(),
            operation: "send",
        })?;
        let msg_id: i64 = row.try_get("msg_id")?;
        debug!(queue = %queue_name, msg_id, "sent message");
        Ok(msg_id)
    }

    /// Send several messages in one call; ids come back in input order.
    pub async fn send_batch(
        &self,
        queue_name: &str,
        messages: &[Value],
        delay: i32,
    ) -> Result<Vec<i64>, PgmqError> {
        let mut conn = self.pool.acquire().await?;
        self.send_batch_in(&mut conn, queue_name, messages, delay)
            .await
    }

    /// Send several messages on an existing connection.
    pub async fn send_batch_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        messages: &[Value],
        delay: i32,
    ) -> Result<Vec<i64>, PgmqError> {
        if messages.is_empty() {
            return Ok(vec![]);
        }
        let rows = sqlx::query("SELECT pgmq.send_batch($1, $2::jsonb[], $3) AS msg_id")
            .bind(queue_name)
            .bind(messages)
            .bind(delay)
            .fetch_all(&mut *conn)
            .await?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get("msg_id")?);
        }
        debug!(queue = %queue_name, count = ids.len(), "sent message batch");
        Ok(ids)
    }

    /// Read up to `batch_size` messages, hiding them for `visibility_timeout`
    /// seconds.
    pub async fn read(
        &self,
        queue_name: &str,
        visibility_timeout: i32,
        batch_size: i32,
    ) -> Result<Vec<PgmqMessage>, PgmqError> {
        let mut conn = self.pool.acquire().await?;
        self.read_in(&mut conn, queue_name, visibility_timeout, batch_size)
            .await
    }

    /// Read messages on an existing connection.
    pub async fn read_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        visibility_timeout: i32,
        batch_size: i32,
    ) -> Result<Vec<PgmqMessage>, PgmqError> {
        let rows = sqlx::query(
            "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, $3)",
        )
        .bind(queue_name)
        .bind(visibility_timeout)
        .bind(batch_size)
        .fetch_all(&mut *conn)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(PgmqMessage {
                msg_id: row.try_get("msg_id")?,
                read_count: row.try_get("read_ct")?,
                enqueued_at: row.try_get("enqueued_at")?,
                vt: row.try_get("vt")?,
                message: row.try_get("message")?,
            });
        }
        Ok(messages)
    }

    /// Delete a message. Returns whether a row was removed.
    pub async fn delete(&self, queue_name: &str, msg_id: i64) -> Result<bool, PgmqError> {
        let mut conn = self.pool.acquire().await?;
        self.delete_in(&mut conn, queue_name, msg_id).await
    }

    /// Delete a message on an existing connection.
    pub async fn delete_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        msg_id: i64,
    ) -> Result<bool, PgmqError> {
        let row = sqlx::query("SELECT pgmq.delete($1, $2) AS deleted")
            .bind(queue_name)
            .bind(msg_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("deleted")?,
            None => false,
        })
    }

    /// Move a message to the queue's archive table.
    pub async fn archive(&self, queue_name: &str, msg_id: i64) -> Result<bool, PgmqError> {
        let mut conn = self.pool.acquire().await?;
        self.archive_in(&mut conn, queue_name, msg_id).await
    }

    /// Archive a message on an existing connection.
    pub async fn archive_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        msg_id: i64,
    ) -> Result<bool, PgmqError> {
        let row = sqlx::query("SELECT pgmq.archive($1, $2) AS archived")
            .bind(queue_name)
            .bind(msg_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("archived")?,
            None => false,
        })
    }

    /// Reset a message's visibility timeout to `visibility_timeout` seconds
    /// from now. Returns whether the message existed.
    pub async fn set_vt(
        &self,
        queue_name: &str,
        msg_id: i64,
        visibility_timeout: i32,
    ) -> Result<bool, PgmqError> {
        let mut conn = self.pool.acquire().await?;
        self.set_vt_in(&mut conn, queue_name, msg_id, visibility_timeout)
            .await
    }

    /// Set a visibility timeout on an existing connection.
    pub async fn set_vt_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        msg_id: i64,
        visibility_timeout: i32,
    ) -> Result<bool, PgmqError> {
        let row = sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue_name)
            .bind(msg_id)
            .bind(visibility_timeout)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    /// Emit the wakeup notification for a queue inside the caller's
    /// transaction. Consumers receive at most one wake per committed
    /// transaction; duplicates are harmless.
    pub async fn notify_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
    ) -> Result<(), PgmqError> {
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(notify_channel(queue_name))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

/// Spawn a task that LISTENs on a queue's notification channel and forwards
/// wakeups to the returned receiver.
///
/// The task holds a dedicated connection for its lifetime. If the
/// connection drops it reconnects with exponential backoff; consumers fall
/// back to polling in the meantime. The task exits when the receiver is
/// dropped.
pub fn spawn_notify_listener(pool: PgPool, queue_name: String) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(16);
    let channel = notify_channel(&queue_name);

    tokio::spawn(async move {
        loop {
            let connect = || async {
                let mut listener = PgListener::connect_with(&pool).await?;
                listener.listen(&channel).await?;
                Ok::<_, sqlx::Error>(listener)
            };

            let mut listener = match connect
                .retry(
                    ExponentialBuilder::default()
                        .with_min_delay(Duration::from_millis(250))
                        .with_max_delay(Duration::from_secs(5))
                        .with_max_times(5),
                )
                .await
            {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "LISTEN connect failed, retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            debug!(channel = %channel, "listening for queue notifications");

            loop {
                match listener.recv().await {
                    Ok(_) => {
                        if tx.send(()).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "LISTEN connection lost, reconnecting");
                        break;
                    }
                }
            }

            if tx.is_closed() {
                return;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_channel_name() {
        assert_eq!(
            notify_channel("payments__commands"),
            "pgmq_notify_payments__commands"
        );
    }

    #[test]
    fn test_no_result_error_display() {
        let err = PgmqError::NoResult {
            queue: "orders__commands".to_string(),
            operation: "send",
        };
        let text = err.to_string();
        assert!(text.contains("orders__commands"));
        assert!(text.contains("send"));
    }
}
