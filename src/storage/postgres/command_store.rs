//! PostgreSQL CommandStore implementation.

use async_trait::async_trait;
use sea_query::{Expr, Order, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::models::{CommandMetadata, CommandStatus, ErrorKind};
use crate::storage::schema::{Commands, Db};
use crate::storage::{is_unique_violation, CommandFilter, CommandStore, Result, StorageError};

const SELECT_COLUMNS: &str = "domain, command_id, command_type, status, attempts, max_attempts, \
     msg_id, queue_name, correlation_id, reply_queue, batch_id, \
     last_error_type, last_error_code, last_error_msg, created_at, updated_at";

/// PostgreSQL implementation of [`CommandStore`].
pub struct PostgresCommandStore {
    pool: PgPool,
}

impl PostgresCommandStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_metadata(row: &PgRow) -> Result<CommandMetadata> {
    let status_text: String = row.try_get("status")?;
    let status = CommandStatus::parse(&status_text).ok_or(StorageError::InvalidColumn {
        column: "status",
        value: status_text,
    })?;

    let error_kind = match row.try_get::<Option<String>, _>("last_error_type")? {
        Some(text) => Some(ErrorKind::parse(&text).ok_or(StorageError::InvalidColumn {
            column: "last_error_type",
            value: text,
        })?),
        None => None,
    };

    Ok(CommandMetadata {
        domain: row.try_get("domain")?,
        command_id: row.try_get("command_id")?,
        command_type: row.try_get("command_type")?,
        status,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        msg_id: row.try_get("msg_id")?,
        queue_name: row.try_get("queue_name")?,
        correlation_id: row.try_get("correlation_id")?,
        reply_to: row.try_get("reply_queue")?,
        batch_id: row.try_get("batch_id")?,
        last_error_type: error_kind,
        last_error_code: row.try_get("last_error_code")?,
        last_error_msg: row.try_get("last_error_msg")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_in(conn: &mut PgConnection, meta: &CommandMetadata) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO commandbus.command (
            domain, command_id, command_type, status, attempts, max_attempts,
            msg_id, queue_name, correlation_id, reply_queue, batch_id,
            last_error_type, last_error_code, last_error_msg, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(&meta.domain)
    .bind(meta.command_id)
    .bind(&meta.command_type)
    .bind(meta.status.as_str())
    .bind(meta.attempts)
    .bind(meta.max_attempts)
    .bind(meta.msg_id)
    .bind(&meta.queue_name)
    .bind(meta.correlation_id)
    .bind(&meta.reply_to)
    .bind(meta.batch_id)
    .bind(meta.last_error_type.map(|k| k.as_str()))
    .bind(&meta.last_error_code)
    .bind(&meta.last_error_msg)
    .bind(meta.created_at)
    .bind(meta.updated_at)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => {
            debug!(domain = %meta.domain, command_id = %meta.command_id, "saved command metadata");
            Ok(())
        }
        Err(err) if is_unique_violation(&err) => Err(StorageError::DuplicateCommand {
            domain: meta.domain.clone(),
            command_id: meta.command_id,
        }),
        Err(err) => Err(err.into()),
    }
}

async fn fetch_in(
    conn: &mut PgConnection,
    domain: &str,
    command_id: Uuid,
) -> Result<Option<CommandMetadata>> {
    let row = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM commandbus.command WHERE domain = $1 AND command_id = $2"
    ))
    .bind(domain)
    .bind(command_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(row_to_metadata).transpose()
}

async fn exists_in(conn: &mut PgConnection, domain: &str, command_id: Uuid) -> Result<bool> {
    let row = sqlx::query(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM commandbus.command
            WHERE domain = $1 AND command_id = $2
        ) AS present
        "#,
    )
    .bind(domain)
    .bind(command_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.try_get("present")?)
}

async fn update_status_in(
    conn: &mut PgConnection,
    domain: &str,
    command_id: Uuid,
    status: CommandStatus,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE commandbus.command
        SET status = $1, updated_at = now()
        WHERE domain = $2 AND command_id = $3
        "#,
    )
    .bind(status.as_str())
    .bind(domain)
    .bind(command_id)
    .execute(&mut *conn)
    .await?;
    debug!(domain = %domain, command_id = %command_id, status = status.as_str(), "updated status");
    Ok(())
}

async fn update_msg_id_in(
    conn: &mut PgConnection,
    domain: &str,
    command_id: Uuid,
    msg_id: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE commandbus.command
        SET msg_id = $1, updated_at = now()
        WHERE domain = $2 AND command_id = $3
        "#,
    )
    .bind(msg_id)
    .bind(domain)
    .bind(command_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn increment_attempts_in(
    conn: &mut PgConnection,
    domain: &str,
    command_id: Uuid,
) -> Result<i32> {
    let row = sqlx::query(
        r#"
        UPDATE commandbus.command
        SET attempts = attempts + 1, updated_at = now()
        WHERE domain = $1 AND command_id = $2
        RETURNING attempts
        "#,
    )
    .bind(domain)
    .bind(command_id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(row.try_get("attempts")?),
        None => Err(StorageError::Database(sqlx::Error::RowNotFound)),
    }
}

async fn record_error_in(
    conn: &mut PgConnection,
    domain: &str,
    command_id: Uuid,
    kind: ErrorKind,
    code: &str,
    message: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE commandbus.command
        SET last_error_type = $1, last_error_code = $2, last_error_msg = $3,
            updated_at = now()
        WHERE domain = $4 AND command_id = $5
        "#,
    )
    .bind(kind.as_str())
    .bind(code)
    .bind(message)
    .bind(domain)
    .bind(command_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn reset_for_retry_in(
    conn: &mut PgConnection,
    domain: &str,
    command_id: Uuid,
    msg_id: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE commandbus.command
        SET attempts = 0, status = 'PENDING', msg_id = $1,
            last_error_type = NULL, last_error_code = NULL, last_error_msg = NULL,
            updated_at = now()
        WHERE domain = $2 AND command_id = $3
        "#,
    )
    .bind(msg_id)
    .bind(domain)
    .bind(command_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn query_in(conn: &mut PgConnection, filter: &CommandFilter) -> Result<Vec<CommandMetadata>> {
    let mut query = Query::select();
    query
        .columns([
            Commands::Domain,
            Commands::CommandId,
            Commands::CommandType,
            Commands::Status,
            Commands::Attempts,
            Commands::MaxAttempts,
            Commands::MsgId,
            Commands::QueueName,
            Commands::CorrelationId,
            Commands::ReplyQueue,
            Commands::BatchId,
            Commands::LastErrorType,
            Commands::LastErrorCode,
            Commands::LastErrorMsg,
            Commands::CreatedAt,
            Commands::UpdatedAt,
        ])
        .from((Db::Schema, Commands::Table))
        .order_by(Commands::CreatedAt, Order::Desc)
        .order_by(Commands::CommandId, Order::Desc)
        .limit(filter.limit)
        .offset(filter.offset);

    if let Some(status) = filter.status {
        query.and_where(Expr::col(Commands::Status).eq(status.as_str()));
    }
    if let Some(domain) = &filter.domain {
        query.and_where(Expr::col(Commands::Domain).eq(domain.as_str()));
    }
    if let Some(command_type) = &filter.command_type {
        query.and_where(Expr::col(Commands::CommandType).eq(command_type.as_str()));
    }
    if let Some(created_after) = filter.created_after {
        query.and_where(Expr::col(Commands::CreatedAt).gte(created_after));
    }
    if let Some(created_before) = filter.created_before {
        query.and_where(Expr::col(Commands::CreatedAt).lte(created_before));
    }

    let (sql, values) = query.build_sqlx(PostgresQueryBuilder);
    let rows = sqlx::query_with(&sql, values).fetch_all(&mut *conn).await?;

    rows.iter().map(row_to_metadata).collect()
}

#[async_trait]
impl CommandStore for PostgresCommandStore {
    async fn insert(&self, meta: &CommandMetadata, conn: Option<&mut PgConnection>) -> Result<()> {
        match conn {
            Some(conn) => insert_in(conn, meta).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                insert_in(&mut conn, meta).await
            }
        }
    }

    async fn fetch(
        &self,
        domain: &str,
        command_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Option<CommandMetadata>> {
        match conn {
            Some(conn) => fetch_in(conn, domain, command_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                fetch_in(&mut conn, domain, command_id).await
            }
        }
    }

    async fn exists(
        &self,
        domain: &str,
        command_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<bool> {
        match conn {
            Some(conn) => exists_in(conn, domain, command_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                exists_in(&mut conn, domain, command_id).await
            }
        }
    }

    async fn update_status(
        &self,
        domain: &str,
        command_id: Uuid,
        status: CommandStatus,
        conn: Option<&mut PgConnection>,
    ) -> Result<()> {
        match conn {
            Some(conn) => update_status_in(conn, domain, command_id, status).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                update_status_in(&mut conn, domain, command_id, status).await
            }
        }
    }

    async fn update_msg_id(
        &self,
        domain: &str,
        command_id: Uuid,
        msg_id: i64,
        conn: Option<&mut PgConnection>,
    ) -> Result<()> {
        match conn {
            Some(conn) => update_msg_id_in(conn, domain, command_id, msg_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                update_msg_id_in(&mut conn, domain, command_id, msg_id).await
            }
        }
    }

    async fn increment_attempts(
        &self,
        domain: &str,
        command_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<i32> {
        match conn {
            Some(conn) => increment_attempts_in(conn, domain, command_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                increment_attempts_in(&mut conn, domain, command_id).await
            }
        }
    }

    async fn record_error(
        &self,
        domain: &str,
        command_id: Uuid,
        kind: ErrorKind,
        code: &str,
        message: &str,
        conn: Option<&mut PgConnection>,
    ) -> Result<()> {
        match conn {
            Some(conn) => record_error_in(conn, domain, command_id, kind, code, message).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                record_error_in(&mut conn, domain, command_id, kind, code, message).await
            }
        }
    }

    async fn reset_for_retry(
        &self,
        domain: &str,
        command_id: Uuid,
        msg_id: i64,
        conn: Option<&mut PgConnection>,
    ) -> Result<()> {
        match conn {
            Some(conn) => reset_for_retry_in(conn, domain, command_id, msg_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                reset_for_retry_in(&mut conn, domain, command_id, msg_id).await
            }
        }
    }

    async fn query(
        &self,
        filter: &CommandFilter,
        conn: Option<&mut PgConnection>,
    ) -> Result<Vec<CommandMetadata>> {
        match conn {
            Some(conn) => query_in(conn, filter).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                query_in(&mut conn, filter).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CommandStatus;

    #[test]
    fn test_query_sql_shape() {
        let filter = CommandFilter::default()
            .with_status(CommandStatus::Pending)
            .with_domain("payments");

        let mut query = Query::select();
        query
            .column(Commands::CommandId)
            .from((Db::Schema, Commands::Table))
            .order_by(Commands::CreatedAt, Order::Desc)
            .order_by(Commands::CommandId, Order::Desc)
            .limit(filter.limit)
            .offset(filter.offset);
        if let Some(status) = filter.status {
            query.and_where(Expr::col(Commands::Status).eq(status.as_str()));
        }
        if let Some(domain) = &filter.domain {
            query.and_where(Expr::col(Commands::Domain).eq(domain.as_str()));
        }

        let (sql, _values) = query.build_sqlx(PostgresQueryBuilder);
        assert!(sql.contains(r#"FROM "commandbus"."command""#));
        assert!(sql.contains(r#"ORDER BY "created_at" DESC, "command_id" DESC"#));
        assert!(sql.contains("$2"));
    }
}
