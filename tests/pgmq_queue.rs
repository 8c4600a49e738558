//! Queue driver integration tests: the typed PGMQ primitives.

mod common;

use serde_json::json;

use commandbus::pgmq::PgmqClient;

#[tokio::test]
async fn test_send_read_delete_round_trip() {
    let Some(pool) = common::test_pool().await else {
        return;
    };
    let queue = format!("{}__commands", common::unique_domain("pq"));
    let pgmq = PgmqClient::new(pool.clone());
    pgmq.create_queue(&queue).await.unwrap();
    // Idempotent.
    pgmq.create_queue(&queue).await.unwrap();

    let msg_id = pgmq.send(&queue, &json!({"n": 1}), 0).await.unwrap();

    let messages = pgmq.read(&queue, 30, 10).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].msg_id, msg_id);
    assert_eq!(messages[0].read_count, 1);
    assert_eq!(messages[0].message["n"], 1);

    // Claimed: invisible to a second reader.
    let hidden = pgmq.read(&queue, 30, 10).await.unwrap();
    assert!(hidden.is_empty());

    assert!(pgmq.delete(&queue, msg_id).await.unwrap());
    assert!(!pgmq.delete(&queue, msg_id).await.unwrap());
}

#[tokio::test]
async fn test_set_vt_zero_makes_message_visible() {
    let Some(pool) = common::test_pool().await else {
        return;
    };
    let queue = format!("{}__commands", common::unique_domain("vt"));
    let pgmq = PgmqClient::new(pool.clone());
    pgmq.create_queue(&queue).await.unwrap();

    let msg_id = pgmq.send(&queue, &json!({}), 0).await.unwrap();
    let claimed = pgmq.read(&queue, 60, 1).await.unwrap();
    assert_eq!(claimed.len(), 1);

    // Reset the visibility timeout to now; the message reappears.
    assert!(pgmq.set_vt(&queue, msg_id, 0).await.unwrap());
    let redelivered = pgmq.read(&queue, 30, 1).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].msg_id, msg_id);
    assert_eq!(redelivered[0].read_count, 2);
}

#[tokio::test]
async fn test_archive_preserves_message() {
    let Some(pool) = common::test_pool().await else {
        return;
    };
    let queue = format!("{}__commands", common::unique_domain("ar"));
    let pgmq = PgmqClient::new(pool.clone());
    pgmq.create_queue(&queue).await.unwrap();

    let msg_id = pgmq.send(&queue, &json!({"keep": true}), 0).await.unwrap();
    assert!(pgmq.archive(&queue, msg_id).await.unwrap());

    // Gone from the live queue, present in the archive.
    assert!(pgmq.read(&queue, 30, 10).await.unwrap().is_empty());
    let row = sqlx::query(&format!(
        "SELECT message FROM pgmq.a_{queue} WHERE msg_id = $1"
    ))
    .bind(msg_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    let message: serde_json::Value = sqlx::Row::try_get(&row, "message").unwrap();
    assert_eq!(message["keep"], true);
}

#[tokio::test]
async fn test_send_batch_assigns_ids_in_order() {
    let Some(pool) = common::test_pool().await else {
        return;
    };
    let queue = format!("{}__commands", common::unique_domain("sb"));
    let pgmq = PgmqClient::new(pool.clone());
    pgmq.create_queue(&queue).await.unwrap();

    let messages = vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})];
    let ids = pgmq.send_batch(&queue, &messages, 0).await.unwrap();
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

    let read = pgmq.read(&queue, 30, 10).await.unwrap();
    assert_eq!(read.len(), 3);
    assert_eq!(read[0].message["n"], 1);
    assert_eq!(read[2].message["n"], 3);
}

#[tokio::test]
async fn test_send_with_delay_hides_message() {
    let Some(pool) = common::test_pool().await else {
        return;
    };
    let queue = format!("{}__commands", common::unique_domain("dl"));
    let pgmq = PgmqClient::new(pool.clone());
    pgmq.create_queue(&queue).await.unwrap();

    pgmq.send(&queue, &json!({}), 120).await.unwrap();
    assert!(pgmq.read(&queue, 30, 10).await.unwrap().is_empty());
}
