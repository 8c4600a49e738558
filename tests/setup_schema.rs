//! Schema installation integration tests.

mod common;

use sqlx::Row;

use commandbus::storage::setup::{check_schema_exists, get_schema_sql, setup_database};

#[tokio::test]
async fn test_setup_is_idempotent() {
    let Some(pool) = common::test_pool().await else {
        return;
    };

    // The harness already installed the schema once; a second and third
    // run must be harmless.
    setup_database(&pool).await.unwrap();
    setup_database(&pool).await.unwrap();

    assert!(check_schema_exists(&pool).await.unwrap());
}

#[tokio::test]
async fn test_setup_installs_tables_and_procedures() {
    let Some(pool) = common::test_pool().await else {
        return;
    };

    for table in ["command", "audit", "batch", "process", "process_audit"] {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'commandbus' AND table_name = $1
            ) AS present
            "#,
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(
            row.try_get::<bool, _>("present").unwrap(),
            "missing table {table}"
        );
    }

    for procedure in ["sp_receive_command", "sp_finish_command"] {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM pg_proc p
                JOIN pg_namespace n ON n.oid = p.pronamespace
                WHERE n.nspname = 'commandbus' AND p.proname = $1
            ) AS present
            "#,
        )
        .bind(procedure)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(
            row.try_get::<bool, _>("present").unwrap(),
            "missing procedure {procedure}"
        );
    }
}

#[tokio::test]
async fn test_schema_sql_is_exposed() {
    // Pure check; no database needed.
    let sql = get_schema_sql();
    assert!(sql.contains("CREATE SCHEMA IF NOT EXISTS commandbus"));
}
