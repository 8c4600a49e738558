//! Troubleshooting queue integration tests: listings and operator
//! retry/cancel/complete.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::Row;
use uuid::Uuid;

use commandbus::config::WorkerConfig;
use commandbus::storage::AuditEventType;
use commandbus::tsq::TsqError;
use commandbus::{
    CommandBus, CommandSender, CommandStatus, HandlerError, HandlerRegistry, RetryPolicy,
    SendRequest, TroubleshootingQueue, Worker,
};

/// Send one command and fail it permanently so it lands in
/// troubleshooting.
async fn enroll_command(
    pool: &sqlx::PgPool,
    bus: &CommandBus,
    domain: &str,
    reply_to: Option<&str>,
) -> Uuid {
    let command_id = Uuid::new_v4();
    let mut request = SendRequest::new(domain, "Debit", command_id, json!({"amount": 5}));
    if let Some(reply_to) = reply_to {
        request = request.with_reply_to(reply_to);
    }
    bus.send(request).await.unwrap();

    let worker = Worker::new(
        pool.clone(),
        Arc::new(HandlerRegistry::new()),
        WorkerConfig {
            retry_policy: RetryPolicy::with_max_attempts(1),
            ..WorkerConfig::for_domain(domain)
        },
    )
    .unwrap();

    let received = worker.receive(1, None).await.unwrap();
    assert_eq!(received.len(), 1);
    worker
        .fail(
            &received[0],
            &HandlerError::permanent("UPSTREAM_GONE", "dependency removed"),
        )
        .await
        .unwrap();
    command_id
}

#[tokio::test]
async fn test_listing_includes_archived_payload() {
    let Some(pool) = common::test_pool().await else {
        return;
    };
    let domain = common::unique_domain("lst");
    let bus = CommandBus::new(pool.clone());
    bus.ensure_queue(&domain).await.unwrap();
    let command_id = enroll_command(&pool, &bus, &domain, None).await;

    let tsq = TroubleshootingQueue::new(pool.clone());

    let items = tsq.list_troubleshooting(&domain, None, 50, 0).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].command_id, command_id);
    assert_eq!(items[0].last_error_code.as_deref(), Some("UPSTREAM_GONE"));
    let payload = items[0].payload.as_ref().unwrap();
    assert_eq!(payload["data"]["amount"], 5);

    assert_eq!(tsq.count_troubleshooting(&domain, None).await.unwrap(), 1);
    assert_eq!(
        tsq.count_troubleshooting(&domain, Some("Debit")).await.unwrap(),
        1
    );
    assert_eq!(
        tsq.count_troubleshooting(&domain, Some("Credit"))
            .await
            .unwrap(),
        0
    );

    assert!(tsq.list_domains().await.unwrap().contains(&domain));
    assert_eq!(
        tsq.get_command_domain(command_id).await.unwrap(),
        Some(domain.clone())
    );
    assert_eq!(
        tsq.list_command_ids(&domain, None).await.unwrap(),
        vec![command_id]
    );

    // The cross-domain listing picks it up too.
    let everywhere = tsq.list_all_troubleshooting(None, 1000).await.unwrap();
    assert!(everywhere.iter().any(|item| item.command_id == command_id));
}

#[tokio::test]
async fn test_operator_retry_re_enqueues_archived_payload() {
    let Some(pool) = common::test_pool().await else {
        return;
    };
    let domain = common::unique_domain("opr");
    let bus = CommandBus::new(pool.clone());
    bus.ensure_queue(&domain).await.unwrap();
    let command_id = enroll_command(&pool, &bus, &domain, None).await;

    let tsq = TroubleshootingQueue::new(pool.clone());
    let new_msg_id = tsq
        .operator_retry(&domain, command_id, "admin@example.com")
        .await
        .unwrap();

    let meta = bus.get_command(&domain, command_id).await.unwrap().unwrap();
    assert_eq!(meta.status, CommandStatus::Pending);
    assert_eq!(meta.attempts, 0);
    assert_eq!(meta.msg_id, Some(new_msg_id));
    assert!(meta.last_error_code.is_none());

    // The command is readable again and completes normally.
    let worker = Worker::new(
        pool.clone(),
        Arc::new(HandlerRegistry::new()),
        WorkerConfig::for_domain(&domain),
    )
    .unwrap();
    let received = worker.receive(1, None).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].command.command_id, command_id);
    assert_eq!(received[0].attempt, 1);
    worker.complete(&received[0], None).await.unwrap();

    let meta = bus.get_command(&domain, command_id).await.unwrap().unwrap();
    assert_eq!(meta.status, CommandStatus::Completed);
}

#[tokio::test]
async fn test_operator_cancel_replies_when_producer_waits() {
    let Some(pool) = common::test_pool().await else {
        return;
    };
    let domain = common::unique_domain("opc");
    let bus = CommandBus::new(pool.clone());
    bus.ensure_queue(&domain).await.unwrap();
    bus.ensure_reply_queue("opc_replies").await.unwrap();
    let command_id = enroll_command(&pool, &bus, &domain, Some("opc_replies")).await;

    let tsq = TroubleshootingQueue::new(pool.clone());
    tsq.operator_cancel(&domain, command_id, "admin@example.com", Some("obsolete"))
        .await
        .unwrap();

    let meta = bus.get_command(&domain, command_id).await.unwrap().unwrap();
    assert_eq!(meta.status, CommandStatus::Canceled);

    let row = sqlx::query(
        "SELECT message FROM pgmq.q_opc_replies WHERE message->>'command_id' = $1",
    )
    .bind(command_id.to_string())
    .fetch_one(&pool)
    .await
    .unwrap();
    let reply: Value = row.try_get("message").unwrap();
    assert_eq!(reply["outcome"], "CANCELED");

    let trail = bus.get_audit_trail(&domain, command_id).await.unwrap();
    let last = trail.last().unwrap();
    assert_eq!(last.event_type, AuditEventType::OperatorCancel);
    assert_eq!(last.details.as_ref().unwrap()["reason"], "obsolete");
}

#[tokio::test]
async fn test_operator_complete_finishes_command() {
    let Some(pool) = common::test_pool().await else {
        return;
    };
    let domain = common::unique_domain("opf");
    let bus = CommandBus::new(pool.clone());
    bus.ensure_queue(&domain).await.unwrap();
    bus.ensure_reply_queue("opf_replies").await.unwrap();
    let command_id = enroll_command(&pool, &bus, &domain, Some("opf_replies")).await;

    let tsq = TroubleshootingQueue::new(pool.clone());
    tsq.operator_complete(
        &domain,
        command_id,
        "admin@example.com",
        Some(json!({"resolved": "manually"})),
    )
    .await
    .unwrap();

    let meta = bus.get_command(&domain, command_id).await.unwrap().unwrap();
    assert_eq!(meta.status, CommandStatus::Completed);

    let row = sqlx::query(
        "SELECT message FROM pgmq.q_opf_replies WHERE message->>'command_id' = $1",
    )
    .bind(command_id.to_string())
    .fetch_one(&pool)
    .await
    .unwrap();
    let reply: Value = row.try_get("message").unwrap();
    assert_eq!(reply["outcome"], "SUCCESS");
    assert_eq!(reply["data"]["resolved"], "manually");

    let events: Vec<_> = bus
        .get_audit_trail(&domain, command_id)
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.event_type)
        .collect();
    assert!(events.contains(&AuditEventType::MovedToTsq));
    assert_eq!(*events.last().unwrap(), AuditEventType::OperatorComplete);
}

#[tokio::test]
async fn test_operator_actions_require_troubleshooting_status() {
    let Some(pool) = common::test_pool().await else {
        return;
    };
    let domain = common::unique_domain("opx");
    let bus = CommandBus::new(pool.clone());
    bus.ensure_queue(&domain).await.unwrap();

    // Pending command, never failed.
    let command_id = Uuid::new_v4();
    bus.send(SendRequest::new(&domain, "Debit", command_id, json!({})))
        .await
        .unwrap();

    let tsq = TroubleshootingQueue::new(pool.clone());
    let err = tsq
        .operator_retry(&domain, command_id, "admin@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, TsqError::NotInTroubleshootingQueue { .. }));

    let err = tsq
        .operator_cancel(&domain, Uuid::new_v4(), "admin@example.com", None)
        .await
        .unwrap_err();
    assert!(matches!(err, TsqError::CommandNotFound { .. }));
}
