//! PostgreSQL audit log implementation. Append-only.

use async_trait::async_trait;
use sea_query::{PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::storage::schema::{Audit, Db};
use crate::storage::{AuditEvent, AuditEventType, AuditLog, AuditRecord, Result, StorageError};

/// PostgreSQL implementation of [`AuditLog`].
pub struct PostgresAuditLog {
    pool: PgPool,
}

impl PostgresAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_event(row: &PgRow) -> Result<AuditEvent> {
    let event_text: String = row.try_get("event_type")?;
    let event_type = AuditEventType::parse(&event_text).ok_or(StorageError::InvalidColumn {
        column: "event_type",
        value: event_text,
    })?;

    Ok(AuditEvent {
        audit_id: row.try_get("audit_id")?,
        domain: row.try_get("domain")?,
        command_id: row.try_get("command_id")?,
        event_type,
        ts: row.try_get("ts")?,
        details: row.try_get("details_json")?,
    })
}

async fn log_in(
    conn: &mut PgConnection,
    domain: &str,
    command_id: Uuid,
    event_type: AuditEventType,
    details: Option<Value>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO commandbus.audit (domain, command_id, event_type, details_json)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(domain)
    .bind(command_id)
    .bind(event_type.as_str())
    .bind(details)
    .execute(&mut *conn)
    .await?;
    debug!(domain = %domain, command_id = %command_id, event = event_type.as_str(), "audit");
    Ok(())
}

async fn events_in(
    conn: &mut PgConnection,
    domain: Option<&str>,
    command_id: Uuid,
) -> Result<Vec<AuditEvent>> {
    let rows = match domain {
        Some(domain) => {
            sqlx::query(
                r#"
                SELECT audit_id, domain, command_id, event_type, ts, details_json
                FROM commandbus.audit
                WHERE command_id = $1 AND domain = $2
                ORDER BY ts ASC, audit_id ASC
                "#,
            )
            .bind(command_id)
            .bind(domain)
            .fetch_all(&mut *conn)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT audit_id, domain, command_id, event_type, ts, details_json
                FROM commandbus.audit
                WHERE command_id = $1
                ORDER BY ts ASC, audit_id ASC
                "#,
            )
            .bind(command_id)
            .fetch_all(&mut *conn)
            .await?
        }
    };

    rows.iter().map(row_to_event).collect()
}

#[async_trait]
impl AuditLog for PostgresAuditLog {
    async fn log(
        &self,
        domain: &str,
        command_id: Uuid,
        event_type: AuditEventType,
        details: Option<Value>,
        conn: Option<&mut PgConnection>,
    ) -> Result<()> {
        match conn {
            Some(conn) => log_in(conn, domain, command_id, event_type, details).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                log_in(&mut conn, domain, command_id, event_type, details).await
            }
        }
    }

    async fn log_batch(&self, records: &[AuditRecord], conn: &mut PgConnection) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut insert = Query::insert();
        insert.into_table((Db::Schema, Audit::Table)).columns([
            Audit::Domain,
            Audit::CommandId,
            Audit::EventType,
            Audit::DetailsJson,
        ]);
        for record in records {
            insert.values_panic([
                record.domain.clone().into(),
                record.command_id.into(),
                record.event_type.as_str().into(),
                record.details.clone().into(),
            ]);
        }

        let (sql, values) = insert.build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(&mut *conn).await?;
        debug!(count = records.len(), "audit batch");
        Ok(())
    }

    async fn events(
        &self,
        domain: Option<&str>,
        command_id: Uuid,
        conn: Option<&mut PgConnection>,
    ) -> Result<Vec<AuditEvent>> {
        match conn {
            Some(conn) => events_in(conn, domain, command_id).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                events_in(&mut conn, domain, command_id).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_batch_insert_sql_shape() {
        let records = vec![
            AuditRecord {
                domain: "payments".to_string(),
                command_id: Uuid::new_v4(),
                event_type: AuditEventType::Sent,
                details: Some(json!({"max_attempts": 3})),
            },
            AuditRecord {
                domain: "payments".to_string(),
                command_id: Uuid::new_v4(),
                event_type: AuditEventType::Sent,
                details: None,
            },
        ];

        let mut insert = Query::insert();
        insert.into_table((Db::Schema, Audit::Table)).columns([
            Audit::Domain,
            Audit::CommandId,
            Audit::EventType,
            Audit::DetailsJson,
        ]);
        for record in &records {
            insert.values_panic([
                record.domain.clone().into(),
                record.command_id.into(),
                record.event_type.as_str().into(),
                record.details.clone().into(),
            ]);
        }

        let (sql, _values) = insert.build_sqlx(PostgresQueryBuilder);
        assert!(sql.contains(r#"INSERT INTO "commandbus"."audit""#));
        assert!(sql.contains("$8"));
    }
}
