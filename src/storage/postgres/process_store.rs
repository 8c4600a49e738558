//! PostgreSQL ProcessStore implementation.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::models::ReplyOutcome;
use crate::process::{NewProcessAuditEntry, ProcessAuditEntry, ProcessMetadata, ProcessStatus};
use crate::storage::{ProcessStore, Result, StorageError};

const SELECT_COLUMNS: &str = "domain, process_id, process_type, status, current_step, state, \
     error_code, error_message, created_at, updated_at, completed_at";

/// PostgreSQL implementation of [`ProcessStore`].
pub struct PostgresProcessStore {
    pool: PgPool,
}

impl PostgresProcessStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_process(row: &PgRow) -> Result<ProcessMetadata> {
    let status_text: String = row.try_get("status")?;
    let status = ProcessStatus::parse(&status_text).ok_or(StorageError::InvalidColumn {
        column: "status",
        value: status_text,
    })?;

    Ok(ProcessMetadata {
        domain: row.try_get("domain")?,
        process_id: row.try_get("process_id")?,
        process_type: row.try_get("process_type")?,
        status,
        current_step: row.try_get("current_step")?,
        state: row.try_get("state")?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn row_to_entry(row: &PgRow) -> Result<ProcessAuditEntry> {
    let outcome = match row.try_get::<Option<String>, _>("reply_outcome")? {
        Some(text) => Some(ReplyOutcome::parse(&text).ok_or(StorageError::InvalidColumn {
            column: "reply_outcome",
            value: text,
        })?),
        None => None,
    };

    Ok(ProcessAuditEntry {
        entry_id: row.try_get("entry_id")?,
        domain: row.try_get("domain")?,
        process_id: row.try_get("process_id")?,
        step_name: row.try_get("step_name")?,
        command_id: row.try_get("command_id")?,
        command_type: row.try_get("command_type")?,
        command_data: row.try_get("command_data")?,
        sent_at: row.try_get("sent_at")?,
        reply_outcome: outcome,
        reply_data: row.try_get("reply_data")?,
        received_at: row.try_get("received_at")?,
    })
}

async fn save_in(conn: &mut PgConnection, process: &ProcessMetadata) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO commandbus.process (
            domain, process_id, process_type, status, current_step, state,
            error_code, error_message, created_at, updated_at, completed_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(&process.domain)
    .bind(process.process_id)
    .bind(&process.process_type)
    .bind(process.status.as_str())
    .bind(&process.current_step)
    .bind(&process.state)
    .bind(&process.error_code)
    .bind(&process.error_message)
    .bind(process.created_at)
    .bind(process.updated_at)
    .bind(process.completed_at)
    .execute(&mut *conn)
    .await?;
    debug!(process_id = %process.process_id, "saved process");
    Ok(())
}

async fn get_in(
    conn: &mut PgConnection,
    domain: &str,
    process_id: Uuid,
) -> Result<Option<ProcessMetadata>> {
    let row = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM commandbus.process WHERE domain = $1 AND process_id = $2"
    ))
    .bind(domain)
    .bind(process_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_process).transpose()
}

async fn get_by_id_in(conn: &mut PgConnection, process_id: Uuid) -> Result<Option<ProcessMetadata>> {
    let row = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM commandbus.process WHERE process_id = $1 LIMIT 1"
    ))
    .bind(process_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_process).transpose()
}

async fn update_in(conn: &mut PgConnection, process: &ProcessMetadata) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE commandbus.process
        SET status = $1, current_step = $2, state = $3,
            error_code = $4, error_message = $5,
            updated_at = $6, completed_at = $7
        WHERE domain = $8 AND process_id = $9
        "#,
    )
    .bind(process.status.as_str())
    .bind(&process.current_step)
    .bind(&process.state)
    .bind(&process.error_code)
    .bind(&process.error_message)
    .bind(process.updated_at)
    .bind(process.completed_at)
    .bind(&process.domain)
    .bind(process.process_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn append_step_in(conn: &mut PgConnection, entry: &NewProcessAuditEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO commandbus.process_audit (
            domain, process_id, step_name, command_id, command_type, command_data
        ) VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&entry.domain)
    .bind(entry.process_id)
    .bind(&entry.step_name)
    .bind(entry.command_id)
    .bind(&entry.command_type)
    .bind(&entry.command_data)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn record_reply_in(
    conn: &mut PgConnection,
    domain: &str,
    process_id: Uuid,
    step_name: &str,
    outcome: ReplyOutcome,
    reply_data: Option<&Value>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE commandbus.process_audit
        SET reply_outcome = $1, reply_data = $2, received_at = clock_timestamp()
        WHERE entry_id = (
            SELECT entry_id FROM commandbus.process_audit
            WHERE domain = $3 AND process_id = $4 AND step_name = $5
            ORDER BY entry_id DESC
            LIMIT 1
        )
        "#,
    )
    .bind(outcome.as_str())
    .bind(reply_data)
    .bind(domain)
    .bind(process_id)
    .bind(step_name)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn completed_steps_in(
    conn: &mut PgConnection,
    domain: &str,
    process_id: Uuid,
) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT step_name FROM commandbus.process_audit
        WHERE domain = $1 AND process_id = $2 AND reply_outcome = 'SUCCESS'
        ORDER BY entry_id DESC
        "#,
    )
    .bind(domain)
    .bind(process_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut steps = Vec::with_capacity(rows.len());
    for row in rows {
        steps.push(row.try_get("step_name")?);
    }
    Ok(steps)
}

async fn entries_in(
    conn: &mut PgConnection,
    domain: &str,
    process_id: Uuid,
) -> Result<Vec<ProcessAuditEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT entry_id, domain, process_id, step_name, command_id, command_type,
               command_data, sent_at, reply_outcome, reply_data, received_at
        FROM commandbus.process_audit
        WHERE domain = $1 AND process_id = $2
        ORDER BY entry_id ASC
        "#,
    )
    .bind(domain)
    .bind(process_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(row_to_entry).collect()
}

#[async_trait]
impl ProcessStore for PostgresProcessStore {
    async fn save(&self, process: &ProcessMetadata, conn: Option<&mut PgConnection>) -> Result<()> {
        match conn {
            Some(conn) => save_in(conn, process).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                save_in(&mut conn, process).await
            }
        }
    }

    async fn get(
        &self,
        domain: &str,
        process_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Option<ProcessMetadata>> {
        match conn {
            Some(conn) => get_in(conn, domain, process_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                get_in(&mut conn, domain, process_id).await
            }
        }
    }

    async fn get_by_id(
        &self,
        process_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Option<ProcessMetadata>> {
        match conn {
            Some(conn) => get_by_id_in(conn, process_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                get_by_id_in(&mut conn, process_id).await
            }
        }
    }

    async fn update(&self, process: &ProcessMetadata, conn: Option<&mut PgConnection>) -> Result<()> {
        match conn {
            Some(conn) => update_in(conn, process).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                update_in(&mut conn, process).await
            }
        }
    }

    async fn append_step(
        &self,
        entry: &NewProcessAuditEntry,
        conn: Option<&mut PgConnection>,
    ) -> Result<()> {
        match conn {
            Some(conn) => append_step_in(conn, entry).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                append_step_in(&mut conn, entry).await
            }
        }
    }

    async fn record_reply(
        &self,
        domain: &str,
        process_id: Uuid,
        step_name: &str,
        outcome: ReplyOutcome,
        reply_data: Option<&Value>,
        conn: Option<&mut PgConnection>,
    ) -> Result<()> {
        match conn {
            Some(conn) => {
                record_reply_in(conn, domain, process_id, step_name, outcome, reply_data).await
            }
            None => {
                let mut conn = self.pool.acquire().await?;
                record_reply_in(&mut conn, domain, process_id, step_name, outcome, reply_data).await
            }
        }
    }

    async fn completed_steps(
        &self,
        domain: &str,
        process_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Vec<String>> {
        match conn {
            Some(conn) => completed_steps_in(conn, domain, process_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                completed_steps_in(&mut conn, domain, process_id).await
            }
        }
    }

    async fn entries(
        &self,
        domain: &str,
        process_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Vec<ProcessAuditEntry>> {
        match conn {
            Some(conn) => entries_in(conn, domain, process_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                entries_in(&mut conn, domain, process_id).await
            }
        }
    }
}
