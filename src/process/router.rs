//! Reply routing for process managers.
//!
//! The router is a worker-shaped consumer over a shared reply queue. Each
//! reply is correlated to a process by `correlation_id = process_id` and
//! dispatched to the manager registered for the process type. The reply
//! message is deleted in the same transaction that persists the process
//! mutation; on error the transaction rolls back and the message
//! redelivers after its visibility timeout.
//!
//! Unroutable replies (unparseable, no correlation id, unknown process or
//! type) are logged and dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::models::Reply;
use crate::pgmq::{spawn_notify_listener, PgmqClient, PgmqMessage};
use crate::process::{DynProcessManager, ProcessError};
use crate::storage::{ProcessStore, StorageError};

/// Runtime options for the router loop.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Replies fetched per read cycle.
    pub batch_size: i32,
    /// Poll interval when no notification arrives.
    pub poll_interval_s: f64,
    /// LISTEN on the reply queue's notify channel.
    pub use_notify: bool,
    /// Visibility timeout for claimed replies.
    pub visibility_timeout_s: i32,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval_s: 1.0,
            use_notify: true,
            visibility_timeout_s: 30,
        }
    }
}

/// Routes replies from a reply queue to registered process managers.
pub struct ProcessReplyRouter {
    pool: PgPool,
    pgmq: PgmqClient,
    store: Arc<dyn ProcessStore>,
    managers: HashMap<String, Arc<dyn DynProcessManager>>,
    reply_queue: String,
    domain: String,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl ProcessReplyRouter {
    pub fn new(pool: PgPool, store: Arc<dyn ProcessStore>, domain: &str, reply_queue: &str) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            pgmq: PgmqClient::new(pool.clone()),
            pool,
            store,
            managers: HashMap::new(),
            reply_queue: reply_queue.to_string(),
            domain: domain.to_string(),
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Register a manager under its process type.
    pub fn register_manager(&mut self, manager: Arc<dyn DynProcessManager>) {
        let process_type = manager.process_type().to_string();
        debug!(process_type = %process_type, "registered process manager");
        self.managers.insert(process_type, manager);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the run loop to stop.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Consume the reply queue until [`ProcessReplyRouter::stop`].
    pub async fn run(&self, options: RouterOptions) -> Result<(), ProcessError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProcessError::RouterAlreadyRunning);
        }
        self.shutdown_tx.send_replace(false);

        let result = self.run_loop(&options).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_loop(&self, options: &RouterOptions) -> Result<(), ProcessError> {
        self.pgmq.create_queue(&self.reply_queue).await?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut notify_rx: Option<mpsc::Receiver<()>> = if options.use_notify {
            Some(spawn_notify_listener(
                self.pool.clone(),
                self.reply_queue.clone(),
            ))
        } else {
            None
        };
        let poll_interval = Duration::from_secs_f64(options.poll_interval_s);

        info!(
            domain = %self.domain,
            reply_queue = %self.reply_queue,
            managers = self.managers.len(),
            "reply router started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let wake = async {
                match notify_rx.as_mut() {
                    Some(rx) => {
                        rx.recv().await;
                    }
                    None => futures::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = wake => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }

            self.read_cycle(options).await;
        }

        info!(domain = %self.domain, "reply router stopped");
        Ok(())
    }

    async fn read_cycle(&self, options: &RouterOptions) {
        let messages = match self
            .pgmq
            .read(
                &self.reply_queue,
                options.visibility_timeout_s,
                options.batch_size,
            )
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                error!(reply_queue = %self.reply_queue, error = %err, "reply read failed");
                return;
            }
        };

        for message in messages {
            if let Err(err) = self.route_reply(&message).await {
                // Rolled back; the reply redelivers after its visibility
                // timeout.
                error!(
                    msg_id = message.msg_id,
                    error = %err,
                    "reply handling failed"
                );
            }
        }
    }

    /// Route one reply. Process mutation and reply deletion share a
    /// transaction.
    async fn route_reply(&self, message: &PgmqMessage) -> Result<(), ProcessError> {
        let reply: Reply = match serde_json::from_value(message.message.clone()) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(msg_id = message.msg_id, error = %err, "unparseable reply, dropping");
                self.pgmq.delete(&self.reply_queue, message.msg_id).await?;
                return Ok(());
            }
        };

        let Some(correlation_id) = reply.correlation_id else {
            warn!(
                msg_id = message.msg_id,
                command_id = %reply.command_id,
                "reply without correlation id, dropping"
            );
            self.pgmq.delete(&self.reply_queue, message.msg_id).await?;
            return Ok(());
        };

        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        let meta = self.store.get_by_id(correlation_id, Some(&mut *tx)).await?;
        let Some(mut meta) = meta else {
            warn!(
                correlation_id = %correlation_id,
                "no process for reply, dropping"
            );
            self.pgmq
                .delete_in(&mut tx, &self.reply_queue, message.msg_id)
                .await?;
            tx.commit().await.map_err(StorageError::from)?;
            return Ok(());
        };

        let Some(manager) = self.managers.get(&meta.process_type) else {
            warn!(
                process_id = %meta.process_id,
                process_type = %meta.process_type,
                "no manager registered for process type, dropping reply"
            );
            self.pgmq
                .delete_in(&mut tx, &self.reply_queue, message.msg_id)
                .await?;
            tx.commit().await.map_err(StorageError::from)?;
            return Ok(());
        };

        manager
            .handle_reply(Some(&mut *tx), &reply, &mut meta)
            .await?;
        self.pgmq
            .delete_in(&mut tx, &self.reply_queue, message.msg_id)
            .await?;
        tx.commit().await.map_err(StorageError::from)?;

        debug!(
            process_id = %meta.process_id,
            outcome = reply.outcome.as_str(),
            status = meta.status.as_str(),
            "routed reply"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_router_options_defaults() {
        let options = RouterOptions::default();
        assert_eq!(options.batch_size, 10);
        assert_eq!(options.poll_interval_s, 1.0);
        assert!(options.use_notify);
        assert_eq!(options.visibility_timeout_s, 30);
    }

    #[test]
    fn test_reply_with_result_field_parses() {
        let process_id = Uuid::new_v4();
        let payload = json!({
            "command_id": Uuid::new_v4(),
            "correlation_id": process_id,
            "outcome": "SUCCESS",
            "result": {"foo": "bar"},
        });
        let reply: Reply = serde_json::from_value(payload).unwrap();
        assert_eq!(reply.correlation_id, Some(process_id));
        assert_eq!(reply.data.unwrap()["foo"], "bar");
    }

    #[test]
    fn test_reply_without_correlation_parses_as_none() {
        let payload = json!({
            "command_id": Uuid::new_v4(),
            "outcome": "SUCCESS",
        });
        let reply: Reply = serde_json::from_value(payload).unwrap();
        assert!(reply.correlation_id.is_none());
    }
}
