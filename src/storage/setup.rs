//! Idempotent schema installation.
//!
//! The whole schema ships as one SQL blob built from `CREATE … IF NOT
//! EXISTS` and `CREATE OR REPLACE FUNCTION`, so `setup_database` can run
//! on every deploy. The PGMQ extension itself is assumed installed.
//!
//! `sp_receive_command` and `sp_finish_command` fold the worker's claim
//! and finalize statements into single server round trips; the worker
//! uses them when `use_stored_procedures` is enabled.

use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::models::CommandStatus;
use crate::storage::{AuditEventType, Result};

const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS commandbus;

CREATE TABLE IF NOT EXISTS commandbus.command (
    domain          text        NOT NULL,
    command_id      uuid        NOT NULL,
    command_type    text        NOT NULL,
    status          text        NOT NULL,
    attempts        int         NOT NULL DEFAULT 0,
    max_attempts    int         NOT NULL DEFAULT 3,
    msg_id          bigint,
    queue_name      text        NOT NULL,
    correlation_id  uuid,
    reply_queue     text,
    batch_id        uuid,
    last_error_type text,
    last_error_code text,
    last_error_msg  text,
    created_at      timestamptz NOT NULL DEFAULT now(),
    updated_at      timestamptz NOT NULL DEFAULT now(),
    PRIMARY KEY (domain, command_id)
);

CREATE INDEX IF NOT EXISTS idx_command_domain_status
    ON commandbus.command (domain, status);
CREATE INDEX IF NOT EXISTS idx_command_created
    ON commandbus.command (created_at DESC, command_id DESC);
CREATE INDEX IF NOT EXISTS idx_command_batch
    ON commandbus.command (domain, batch_id)
    WHERE batch_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS commandbus.audit (
    audit_id     bigserial   PRIMARY KEY,
    domain       text        NOT NULL,
    command_id   uuid        NOT NULL,
    event_type   text        NOT NULL,
    ts           timestamptz NOT NULL DEFAULT clock_timestamp(),
    details_json jsonb
);

CREATE INDEX IF NOT EXISTS idx_audit_command
    ON commandbus.audit (domain, command_id, ts);
CREATE INDEX IF NOT EXISTS idx_audit_command_id
    ON commandbus.audit (command_id);

CREATE TABLE IF NOT EXISTS commandbus.batch (
    domain                   text        NOT NULL,
    batch_id                 uuid        NOT NULL,
    name                     text        NOT NULL,
    custom_data              jsonb,
    status                   text        NOT NULL,
    total_count              int         NOT NULL,
    completed_count          int         NOT NULL DEFAULT 0,
    canceled_count           int         NOT NULL DEFAULT 0,
    in_troubleshooting_count int         NOT NULL DEFAULT 0,
    created_at               timestamptz NOT NULL DEFAULT now(),
    started_at               timestamptz,
    completed_at             timestamptz,
    PRIMARY KEY (domain, batch_id)
);

CREATE TABLE IF NOT EXISTS commandbus.process (
    domain        text        NOT NULL,
    process_id    uuid        NOT NULL,
    process_type  text        NOT NULL,
    status        text        NOT NULL,
    current_step  text,
    state         jsonb       NOT NULL,
    error_code    text,
    error_message text,
    created_at    timestamptz NOT NULL DEFAULT now(),
    updated_at    timestamptz NOT NULL DEFAULT now(),
    completed_at  timestamptz,
    PRIMARY KEY (domain, process_id)
);

CREATE INDEX IF NOT EXISTS idx_process_id
    ON commandbus.process (process_id);

CREATE TABLE IF NOT EXISTS commandbus.process_audit (
    entry_id      bigserial   PRIMARY KEY,
    domain        text        NOT NULL,
    process_id    uuid        NOT NULL,
    step_name     text        NOT NULL,
    command_id    uuid        NOT NULL,
    command_type  text        NOT NULL,
    command_data  jsonb,
    sent_at       timestamptz NOT NULL DEFAULT clock_timestamp(),
    reply_outcome text,
    reply_data    jsonb,
    received_at   timestamptz
);

CREATE INDEX IF NOT EXISTS idx_process_audit_process
    ON commandbus.process_audit (process_id, sent_at);

CREATE OR REPLACE FUNCTION commandbus.sp_receive_command(
    p_domain     text,
    p_command_id uuid,
    p_msg_id     bigint
) RETURNS int AS $$
DECLARE
    v_attempts int;
    v_max      int;
BEGIN
    UPDATE commandbus.command
       SET attempts   = attempts + 1,
           status     = 'IN_PROGRESS',
           updated_at = now()
     WHERE domain = p_domain AND command_id = p_command_id
    RETURNING attempts, max_attempts INTO v_attempts, v_max;

    IF NOT FOUND THEN
        RETURN NULL;
    END IF;

    INSERT INTO commandbus.audit (domain, command_id, event_type, details_json)
    VALUES (p_domain, p_command_id, 'RECEIVED',
            jsonb_build_object('msg_id', p_msg_id,
                               'attempt', v_attempts,
                               'max_attempts', v_max));

    RETURN v_attempts;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION commandbus.sp_finish_command(
    p_domain     text,
    p_command_id uuid,
    p_status     text,
    p_event_type text,
    p_error_type text,
    p_error_code text,
    p_error_msg  text,
    p_details    jsonb
) RETURNS void AS $$
BEGIN
    UPDATE commandbus.command
       SET status          = p_status,
           last_error_type = COALESCE(p_error_type, last_error_type),
           last_error_code = COALESCE(p_error_code, last_error_code),
           last_error_msg  = COALESCE(p_error_msg, last_error_msg),
           updated_at      = now()
     WHERE domain = p_domain AND command_id = p_command_id;

    INSERT INTO commandbus.audit (domain, command_id, event_type, details_json)
    VALUES (p_domain, p_command_id, p_event_type, p_details);
END;
$$ LANGUAGE plpgsql;
"#;

/// The full schema as a SQL text blob.
pub fn get_schema_sql() -> &'static str {
    SCHEMA_SQL
}

/// Install the schema. Safe to run repeatedly.
pub async fn setup_database(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    info!("command bus schema installed");
    Ok(())
}

/// Whether the schema has been installed.
pub async fn check_schema_exists(pool: &PgPool) -> Result<bool> {
    let row = sqlx::query(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM information_schema.tables
            WHERE table_schema = 'commandbus' AND table_name = 'command'
        ) AS present
        "#,
    )
    .fetch_one(pool)
    .await?;
    Ok(row.try_get("present")?)
}

/// Claim a command through `sp_receive_command`: bump attempts, mark
/// `IN_PROGRESS`, and append the `RECEIVED` audit in one round trip.
///
/// Returns the new attempt count, or `None` when no metadata row exists.
pub async fn receive_via_procedure(
    conn: &mut PgConnection,
    domain: &str,
    command_id: Uuid,
    msg_id: i64,
) -> Result<Option<i32>> {
    let row = sqlx::query("SELECT commandbus.sp_receive_command($1, $2, $3) AS attempts")
        .bind(domain)
        .bind(command_id)
        .bind(msg_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.try_get("attempts")?)
}

/// Finalize a command through `sp_finish_command`: status transition plus
/// audit append in one round trip. Error columns are only overwritten when
/// the corresponding argument is non-null.
#[allow(clippy::too_many_arguments)]
pub async fn finish_via_procedure(
    conn: &mut PgConnection,
    domain: &str,
    command_id: Uuid,
    status: CommandStatus,
    event_type: AuditEventType,
    error_type: Option<&str>,
    error_code: Option<&str>,
    error_msg: Option<&str>,
    details: Option<&Value>,
) -> Result<()> {
    sqlx::query("SELECT commandbus.sp_finish_command($1, $2, $3, $4, $5, $6, $7, $8)")
        .bind(domain)
        .bind(command_id)
        .bind(status.as_str())
        .bind(event_type.as_str())
        .bind(error_type)
        .bind(error_code)
        .bind(error_msg)
        .bind(details)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_contains_all_tables() {
        let sql = get_schema_sql();
        for table in [
            "commandbus.command",
            "commandbus.audit",
            "commandbus.batch",
            "commandbus.process",
            "commandbus.process_audit",
        ] {
            assert!(sql.contains(table), "schema is missing {table}");
        }
    }

    #[test]
    fn test_schema_is_idempotent_sql() {
        let sql = get_schema_sql();
        assert!(sql.contains("CREATE SCHEMA IF NOT EXISTS"));
        assert!(!sql.contains("DROP "));
        // Every table and index guards with IF NOT EXISTS; functions are
        // CREATE OR REPLACE.
        assert_eq!(
            sql.matches("CREATE TABLE").count(),
            sql.matches("CREATE TABLE IF NOT EXISTS").count()
        );
        assert_eq!(
            sql.matches("CREATE INDEX").count(),
            sql.matches("CREATE INDEX IF NOT EXISTS").count()
        );
        assert_eq!(sql.matches("CREATE OR REPLACE FUNCTION").count(), 2);
    }

    #[test]
    fn test_schema_declares_procedures() {
        let sql = get_schema_sql();
        assert!(sql.contains("commandbus.sp_receive_command"));
        assert!(sql.contains("commandbus.sp_finish_command"));
    }

    #[test]
    fn test_command_table_key() {
        assert!(get_schema_sql().contains("PRIMARY KEY (domain, command_id)"));
    }
}
