//! Shared harness for integration tests.
//!
//! These tests need a PostgreSQL instance with the pgmq extension
//! available. Point `COMMAND_BUS_TEST_DATABASE_URL` at one (for example a
//! container built from the pgmq image); without it every test skips.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Once;
use std::time::{Duration, Instant};

use sqlx::PgPool;
use uuid::Uuid;

use commandbus::config::TimeoutConfig;
use commandbus::storage::{self, setup};

pub const TEST_DATABASE_ENV: &str = "COMMAND_BUS_TEST_DATABASE_URL";

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Connect to the test database and install the schema.
///
/// Returns `None` (test should skip) when the env var is unset.
pub async fn test_pool() -> Option<PgPool> {
    init_tracing();
    let url = match std::env::var(TEST_DATABASE_ENV) {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping: {TEST_DATABASE_ENV} not set");
            return None;
        }
    };

    let pool = storage::connect_pool(&url, &TimeoutConfig::default(), 10)
        .await
        .expect("connect to test database");
    sqlx::raw_sql("CREATE EXTENSION IF NOT EXISTS pgmq")
        .execute(&pool)
        .await
        .expect("install pgmq extension");
    setup::setup_database(&pool).await.expect("install schema");
    Some(pool)
}

/// A unique short domain so concurrent tests never share queues.
/// PGMQ caps queue name length, so only a short id suffix is used.
pub fn unique_domain(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &id[..8])
}

/// Poll until `probe` returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
