//! PostgreSQL BatchStore implementation.

use async_trait::async_trait;
use sea_query::{Expr, Order, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::models::{BatchMetadata, BatchStatus};
use crate::storage::schema::{Batches, Db};
use crate::storage::{BatchOutcome, BatchStore, Result, StorageError};

/// PostgreSQL implementation of [`BatchStore`].
pub struct PostgresBatchStore {
    pool: PgPool,
}

impl PostgresBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_batch(row: &PgRow) -> Result<BatchMetadata> {
    let status_text: String = row.try_get("status")?;
    let status = BatchStatus::parse(&status_text).ok_or(StorageError::InvalidColumn {
        column: "status",
        value: status_text,
    })?;

    Ok(BatchMetadata {
        domain: row.try_get("domain")?,
        batch_id: row.try_get("batch_id")?,
        name: row.try_get("name")?,
        custom_data: row.try_get("custom_data")?,
        status,
        total_count: row.try_get("total_count")?,
        completed_count: row.try_get("completed_count")?,
        canceled_count: row.try_get("canceled_count")?,
        in_troubleshooting_count: row.try_get("in_troubleshooting_count")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

async fn save_in(conn: &mut PgConnection, batch: &BatchMetadata) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO commandbus.batch (
            domain, batch_id, name, custom_data, status, total_count,
            completed_count, canceled_count, in_troubleshooting_count,
            created_at, started_at, completed_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(&batch.domain)
    .bind(batch.batch_id)
    .bind(&batch.name)
    .bind(&batch.custom_data)
    .bind(batch.status.as_str())
    .bind(batch.total_count)
    .bind(batch.completed_count)
    .bind(batch.canceled_count)
    .bind(batch.in_troubleshooting_count)
    .bind(batch.created_at)
    .bind(batch.started_at)
    .bind(batch.completed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn get_in(
    conn: &mut PgConnection,
    domain: &str,
    batch_id: Uuid,
) -> Result<Option<BatchMetadata>> {
    let row = sqlx::query(
        r#"
        SELECT domain, batch_id, name, custom_data, status, total_count,
               completed_count, canceled_count, in_troubleshooting_count,
               created_at, started_at, completed_at
        FROM commandbus.batch
        WHERE domain = $1 AND batch_id = $2
        "#,
    )
    .bind(domain)
    .bind(batch_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_batch).transpose()
}

async fn exists_in(conn: &mut PgConnection, domain: &str, batch_id: Uuid) -> Result<bool> {
    let row = sqlx::query(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM commandbus.batch WHERE domain = $1 AND batch_id = $2
        ) AS present
        "#,
    )
    .bind(domain)
    .bind(batch_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.try_get("present")?)
}

async fn list_in(
    conn: &mut PgConnection,
    domain: &str,
    status: Option<BatchStatus>,
    limit: u64,
    offset: u64,
) -> Result<Vec<BatchMetadata>> {
    let mut query = Query::select();
    query
        .columns([
            Batches::Domain,
            Batches::BatchId,
            Batches::Name,
            Batches::CustomData,
            Batches::Status,
            Batches::TotalCount,
            Batches::CompletedCount,
            Batches::CanceledCount,
            Batches::InTroubleshootingCount,
            Batches::CreatedAt,
            Batches::StartedAt,
            Batches::CompletedAt,
        ])
        .from((Db::Schema, Batches::Table))
        .and_where(Expr::col(Batches::Domain).eq(domain))
        .order_by(Batches::CreatedAt, Order::Desc)
        .order_by(Batches::BatchId, Order::Desc)
        .limit(limit)
        .offset(offset);

    if let Some(status) = status {
        query.and_where(Expr::col(Batches::Status).eq(status.as_str()));
    }

    let (sql, values) = query.build_sqlx(PostgresQueryBuilder);
    let rows = sqlx::query_with(&sql, values).fetch_all(&mut *conn).await?;
    rows.iter().map(row_to_batch).collect()
}

async fn mark_started_in(conn: &mut PgConnection, domain: &str, batch_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE commandbus.batch
        SET status = 'IN_PROGRESS', started_at = now()
        WHERE domain = $1 AND batch_id = $2 AND status = 'PENDING'
        "#,
    )
    .bind(domain)
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// One statement per counter so the batch flips to COMPLETED exactly when
// the outcome counters reach total_count.
const RECORD_COMPLETED: &str = r#"
    UPDATE commandbus.batch
    SET completed_count = completed_count + 1,
        status = CASE
            WHEN completed_count + canceled_count + in_troubleshooting_count + 1 >= total_count
            THEN 'COMPLETED' ELSE status END,
        completed_at = CASE
            WHEN completed_count + canceled_count + in_troubleshooting_count + 1 >= total_count
            THEN now() ELSE completed_at END
    WHERE domain = $1 AND batch_id = $2
"#;

const RECORD_CANCELED: &str = r#"
    UPDATE commandbus.batch
    SET canceled_count = canceled_count + 1,
        status = CASE
            WHEN completed_count + canceled_count + in_troubleshooting_count + 1 >= total_count
            THEN 'COMPLETED' ELSE status END,
        completed_at = CASE
            WHEN completed_count + canceled_count + in_troubleshooting_count + 1 >= total_count
            THEN now() ELSE completed_at END
    WHERE domain = $1 AND batch_id = $2
"#;

const RECORD_IN_TROUBLESHOOTING: &str = r#"
    UPDATE commandbus.batch
    SET in_troubleshooting_count = in_troubleshooting_count + 1
    WHERE domain = $1 AND batch_id = $2
"#;

async fn record_outcome_in(
    conn: &mut PgConnection,
    domain: &str,
    batch_id: Uuid,
    outcome: BatchOutcome,
) -> Result<()> {
    let sql = match outcome {
        BatchOutcome::Completed => RECORD_COMPLETED,
        BatchOutcome::Canceled => RECORD_CANCELED,
        BatchOutcome::InTroubleshooting => RECORD_IN_TROUBLESHOOTING,
    };
    sqlx::query(sql)
        .bind(domain)
        .bind(batch_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn release_troubleshooting_in(
    conn: &mut PgConnection,
    domain: &str,
    batch_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE commandbus.batch
        SET in_troubleshooting_count = GREATEST(in_troubleshooting_count - 1, 0)
        WHERE domain = $1 AND batch_id = $2
        "#,
    )
    .bind(domain)
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl BatchStore for PostgresBatchStore {
    async fn save(&self, batch: &BatchMetadata, conn: Option<&mut PgConnection>) -> Result<()> {
        match conn {
            Some(conn) => save_in(conn, batch).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                save_in(&mut conn, batch).await
            }
        }
    }

    async fn get(
        &self,
        domain: &str,
        batch_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Option<BatchMetadata>> {
        match conn {
            Some(conn) => get_in(conn, domain, batch_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                get_in(&mut conn, domain, batch_id).await
            }
        }
    }

    async fn exists(
        &self,
        domain: &str,
        batch_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<bool> {
        match conn {
            Some(conn) => exists_in(conn, domain, batch_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                exists_in(&mut conn, domain, batch_id).await
            }
        }
    }

    async fn list(
        &self,
        domain: &str,
        status: Option<BatchStatus>,
        limit: u64,
        offset: u64,
        conn: Option<&mut PgConnection>,
    ) -> Result<Vec<BatchMetadata>> {
        match conn {
            Some(conn) => list_in(conn, domain, status, limit, offset).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                list_in(&mut conn, domain, status, limit, offset).await
            }
        }
    }

    async fn mark_started(
        &self,
        domain: &str,
        batch_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<()> {
        match conn {
            Some(conn) => mark_started_in(conn, domain, batch_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                mark_started_in(&mut conn, domain, batch_id).await
            }
        }
    }

    async fn record_outcome(
        &self,
        domain: &str,
        batch_id: Uuid,
        outcome: BatchOutcome,
        conn: Option<&mut PgConnection>,
    ) -> Result<()> {
        match conn {
            Some(conn) => record_outcome_in(conn, domain, batch_id, outcome).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                record_outcome_in(&mut conn, domain, batch_id, outcome).await
            }
        }
    }

    async fn release_troubleshooting(
        &self,
        domain: &str,
        batch_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<()> {
        match conn {
            Some(conn) => release_troubleshooting_in(conn, domain, batch_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                release_troubleshooting_in(&mut conn, domain, batch_id).await
            }
        }
    }
}
