//! Saga integration tests: a two-step process driven end to end through
//! the bus, a worker, and the reply router.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::Row;

use commandbus::config::WorkerConfig;
use commandbus::process::{
    DynProcessManager, ProcessCommand, ProcessError, ProcessReplyRouter, RouterOptions,
};
use commandbus::storage::{PostgresProcessStore, ProcessStore};
use commandbus::{
    Command, CommandBus, CommandHandler, CommandSender, HandlerContext, HandlerError,
    HandlerRegistry, ProcessDefinition, ProcessManager, ProcessStatus, ProcessStep, Reply,
    ReplyOutcome, Worker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferStep {
    Reserve,
    Settle,
    Release,
}

impl ProcessStep for TransferStep {
    fn name(&self) -> &'static str {
        match self {
            TransferStep::Reserve => "reserve",
            TransferStep::Settle => "settle",
            TransferStep::Release => "release",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "reserve" => Some(TransferStep::Reserve),
            "settle" => Some(TransferStep::Settle),
            "release" => Some(TransferStep::Release),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TransferState {
    amount: i64,
    reserved: bool,
}

struct TransferProcess {
    domain: String,
}

#[async_trait]
impl ProcessDefinition for TransferProcess {
    type State = TransferState;
    type Step = TransferStep;

    fn process_type(&self) -> &str {
        "transfer"
    }

    fn domain(&self) -> &str {
        &self.domain
    }

    fn create_initial_state(&self, initial: &Value) -> Result<TransferState, ProcessError> {
        Ok(TransferState {
            amount: initial["amount"].as_i64().unwrap_or(0),
            reserved: false,
        })
    }

    fn first_step(&self, _state: &TransferState) -> TransferStep {
        TransferStep::Reserve
    }

    async fn build_command(
        &self,
        step: TransferStep,
        state: &TransferState,
    ) -> Result<ProcessCommand, ProcessError> {
        let data = json!({"amount": state.amount});
        Ok(match step {
            TransferStep::Reserve => ProcessCommand::new("ReserveFunds", data),
            TransferStep::Settle => ProcessCommand::new("SettleFunds", data),
            TransferStep::Release => ProcessCommand::new("ReleaseFunds", data),
        })
    }

    fn update_state(&self, state: &mut TransferState, step: TransferStep, _reply: &Reply) {
        if step == TransferStep::Reserve {
            state.reserved = true;
        }
    }

    fn next_step(
        &self,
        current: TransferStep,
        _reply: &Reply,
        _state: &TransferState,
    ) -> Option<TransferStep> {
        match current {
            TransferStep::Reserve => Some(TransferStep::Settle),
            TransferStep::Settle | TransferStep::Release => None,
        }
    }

    fn compensation_step(&self, step: TransferStep) -> Option<TransferStep> {
        match step {
            TransferStep::Reserve => Some(TransferStep::Release),
            TransferStep::Settle | TransferStep::Release => None,
        }
    }
}

struct OkHandler;

#[async_trait]
impl CommandHandler for OkHandler {
    async fn handle(
        &self,
        command: &Command,
        _context: &HandlerContext,
    ) -> Result<Option<Value>, HandlerError> {
        Ok(Some(json!({"handled": command.command_type})))
    }
}

struct SettleHandler {
    fail: bool,
}

#[async_trait]
impl CommandHandler for SettleHandler {
    async fn handle(
        &self,
        _command: &Command,
        _context: &HandlerContext,
    ) -> Result<Option<Value>, HandlerError> {
        if self.fail {
            Err(HandlerError::business_rule(
                "LIMIT_EXCEEDED",
                "daily limit exceeded",
            ))
        } else {
            Ok(Some(json!({"settled": true})))
        }
    }
}

struct SagaHarness {
    pool: sqlx::PgPool,
    domain: String,
    store: Arc<PostgresProcessStore>,
    manager: Arc<ProcessManager<TransferProcess>>,
    worker: Arc<Worker>,
    router: Arc<ProcessReplyRouter>,
    worker_handle: tokio::task::JoinHandle<Result<(), commandbus::WorkerError>>,
    router_handle: tokio::task::JoinHandle<Result<(), ProcessError>>,
}

async fn start_harness(pool: sqlx::PgPool, domain: &str, settle_fails: bool) -> SagaHarness {
    let reply_queue = format!("{domain}_rp");
    let bus = Arc::new(CommandBus::new(pool.clone()));
    bus.ensure_queue(domain).await.unwrap();
    bus.ensure_reply_queue(&reply_queue).await.unwrap();

    let store = Arc::new(PostgresProcessStore::new(pool.clone()));
    let manager = Arc::new(ProcessManager::new(
        TransferProcess {
            domain: domain.to_string(),
        },
        bus.clone() as Arc<dyn CommandSender>,
        store.clone() as Arc<dyn ProcessStore>,
        &reply_queue,
        pool.clone(),
    ));

    let mut registry = HandlerRegistry::new();
    registry
        .register(domain, "ReserveFunds", Arc::new(OkHandler))
        .unwrap();
    registry
        .register(domain, "SettleFunds", Arc::new(SettleHandler { fail: settle_fails }))
        .unwrap();
    registry
        .register(domain, "ReleaseFunds", Arc::new(OkHandler))
        .unwrap();

    let worker = Arc::new(
        Worker::new(
            pool.clone(),
            Arc::new(registry),
            WorkerConfig {
                poll_interval_s: 0.05,
                shutdown_grace_s: 5.0,
                ..WorkerConfig::for_domain(domain)
            },
        )
        .unwrap(),
    );
    let worker_handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let mut router = ProcessReplyRouter::new(
        pool.clone(),
        store.clone() as Arc<dyn ProcessStore>,
        domain,
        &reply_queue,
    );
    router.register_manager(manager.clone() as Arc<dyn DynProcessManager>);
    let router = Arc::new(router);
    let router_handle = {
        let router = router.clone();
        tokio::spawn(async move {
            router
                .run(RouterOptions {
                    poll_interval_s: 0.05,
                    ..RouterOptions::default()
                })
                .await
        })
    };

    SagaHarness {
        pool,
        domain: domain.to_string(),
        store,
        manager,
        worker,
        router,
        worker_handle,
        router_handle,
    }
}

impl SagaHarness {
    async fn wait_for_status(&self, process_id: uuid::Uuid, status: ProcessStatus) -> bool {
        common::wait_until(Duration::from_secs(15), || {
            let store = self.store.clone();
            let domain = self.domain.clone();
            async move {
                store
                    .get(&domain, process_id, None)
                    .await
                    .unwrap()
                    .is_some_and(|meta| meta.status == status)
            }
        })
        .await
    }

    async fn shutdown(self) {
        self.worker.stop();
        self.router.stop();
        self.worker_handle.await.unwrap().unwrap();
        self.router_handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_two_step_saga_completes() {
    let Some(pool) = common::test_pool().await else {
        return;
    };
    let domain = common::unique_domain("sg");
    let harness = start_harness(pool.clone(), &domain, false).await;

    let process_id = harness.manager.start(json!({"amount": 40})).await.unwrap();

    assert!(
        harness
            .wait_for_status(process_id, ProcessStatus::Completed)
            .await,
        "saga never completed"
    );

    let meta = harness
        .store
        .get(&domain, process_id, None)
        .await
        .unwrap()
        .unwrap();
    assert!(meta.completed_at.is_some());
    assert_eq!(meta.state["reserved"], true);

    // Every step sent a command and recorded its reply.
    let entries = harness.store.entries(&domain, process_id, None).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].step_name, "reserve");
    assert_eq!(entries[1].step_name, "settle");
    for entry in &entries {
        assert_eq!(entry.reply_outcome, Some(ReplyOutcome::Success));
        assert!(entry.received_at.is_some());
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn test_business_failure_triggers_compensation() {
    let Some(pool) = common::test_pool().await else {
        return;
    };
    let domain = common::unique_domain("sgf");
    let harness = start_harness(pool.clone(), &domain, true).await;

    let process_id = harness.manager.start(json!({"amount": 75})).await.unwrap();

    assert!(
        harness
            .wait_for_status(process_id, ProcessStatus::Canceled)
            .await,
        "saga never canceled"
    );

    let meta = harness
        .store
        .get(&domain, process_id, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta.error_code.as_deref(), Some("LIMIT_EXCEEDED"));
    assert_eq!(meta.error_message.as_deref(), Some("daily limit exceeded"));

    // The completed reserve step was compensated with a release command.
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS total FROM commandbus.command
        WHERE domain = $1 AND command_type = 'ReleaseFunds' AND correlation_id = $2
        "#,
    )
    .bind(&domain)
    .bind(process_id)
    .fetch_one(&harness.pool)
    .await
    .unwrap();
    assert_eq!(row.try_get::<i64, _>("total").unwrap(), 1);

    let entries = harness.store.entries(&domain, process_id, None).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].reply_outcome, Some(ReplyOutcome::Success));
    assert_eq!(entries[1].reply_outcome, Some(ReplyOutcome::Failed));

    harness.shutdown().await;
}
