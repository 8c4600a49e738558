//! Core value types: commands, replies, metadata, and batches.
//!
//! These are the wire and persistence shapes shared by the producer, the
//! worker, the troubleshooting operations, and the process manager. All
//! envelopes serialize to JSON; timestamps are UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Suffix appended to a domain to form its command queue name.
const COMMAND_QUEUE_SUFFIX: &str = "commands";

/// Queue name for a domain's commands: `<domain>__commands`.
pub fn command_queue(domain: &str) -> String {
    format!("{}__{}", domain, COMMAND_QUEUE_SUFFIX)
}

/// Archive table for a queue, maintained by PGMQ: `pgmq.a_<queue>`.
pub fn archive_table(queue_name: &str) -> String {
    format!("pgmq.a_{}", queue_name)
}

/// Status of a command in its lifecycle.
///
/// `Pending → InProgress → {Completed, Failed, Canceled,
/// InTroubleshootingQueue}`. `InProgress → Pending` happens only on the
/// retry path; `InTroubleshootingQueue → Pending` only via operator retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
    InTroubleshootingQueue,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::InProgress => "IN_PROGRESS",
            CommandStatus::Completed => "COMPLETED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Canceled => "CANCELED",
            CommandStatus::InTroubleshootingQueue => "IN_TROUBLESHOOTING_QUEUE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(CommandStatus::Pending),
            "IN_PROGRESS" => Some(CommandStatus::InProgress),
            "COMPLETED" => Some(CommandStatus::Completed),
            "FAILED" => Some(CommandStatus::Failed),
            "CANCELED" => Some(CommandStatus::Canceled),
            "IN_TROUBLESHOOTING_QUEUE" => Some(CommandStatus::InTroubleshootingQueue),
            _ => None,
        }
    }

    /// Terminal statuses are never re-dispatched; the worker archives any
    /// queue message whose metadata reached one of them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Canceled
                | CommandStatus::InTroubleshootingQueue
        )
    }
}

/// Outcome reported in a reply message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyOutcome {
    Success,
    Failed,
    Canceled,
}

impl ReplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyOutcome::Success => "SUCCESS",
            ReplyOutcome::Failed => "FAILED",
            ReplyOutcome::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(ReplyOutcome::Success),
            "FAILED" => Some(ReplyOutcome::Failed),
            "CANCELED" => Some(ReplyOutcome::Canceled),
            _ => None,
        }
    }
}

/// Classification of the last handler error recorded for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Transient,
    Permanent,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::Permanent => "PERMANENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRANSIENT" => Some(ErrorKind::Transient),
            "PERMANENT" => Some(ErrorKind::Permanent),
            _ => None,
        }
    }
}

/// A command addressed to a domain.
///
/// This is also the JSON envelope enqueued in `<domain>__commands`; PGMQ
/// stores it as JSONB and assigns the message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub domain: String,
    pub command_type: String,
    pub command_id: Uuid,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Reply message published on a command's `reply_to` queue.
///
/// The success payload is emitted under `data`; `result` is accepted on
/// ingest for producers that still use the older field name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub command_id: Uuid,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    pub outcome: ReplyOutcome,
    #[serde(default, alias = "result")]
    pub data: Option<Value>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Reply {
    /// Build a success reply for a command.
    pub fn success(command_id: Uuid, correlation_id: Option<Uuid>, data: Option<Value>) -> Self {
        Self {
            command_id,
            correlation_id,
            outcome: ReplyOutcome::Success,
            data,
            error_code: None,
            error_message: None,
        }
    }

    /// Build a failure reply carrying an application error code.
    pub fn failed(
        command_id: Uuid,
        correlation_id: Option<Uuid>,
        error_code: &str,
        error_message: &str,
    ) -> Self {
        Self {
            command_id,
            correlation_id,
            outcome: ReplyOutcome::Failed,
            data: None,
            error_code: Some(error_code.to_string()),
            error_message: Some(error_message.to_string()),
        }
    }

    /// Build a cancellation reply.
    pub fn canceled(command_id: Uuid, correlation_id: Option<Uuid>) -> Self {
        Self {
            command_id,
            correlation_id,
            outcome: ReplyOutcome::Canceled,
            data: None,
            error_code: None,
            error_message: None,
        }
    }
}

/// Canonical per-command record persisted in `commandbus.command`.
#[derive(Debug, Clone)]
pub struct CommandMetadata {
    pub domain: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub status: CommandStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    /// Current PGMQ message id; changes when the command is re-enqueued.
    pub msg_id: Option<i64>,
    pub queue_name: String,
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<String>,
    pub batch_id: Option<Uuid>,
    pub last_error_type: Option<ErrorKind>,
    pub last_error_code: Option<String>,
    pub last_error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommandMetadata {
    /// Fresh metadata for a command about to be enqueued.
    pub fn new(command: &Command, max_attempts: i32, batch_id: Option<Uuid>) -> Self {
        Self {
            domain: command.domain.clone(),
            command_id: command.command_id,
            command_type: command.command_type.clone(),
            status: CommandStatus::Pending,
            attempts: 0,
            max_attempts,
            msg_id: None,
            queue_name: command_queue(&command.domain),
            correlation_id: command.correlation_id,
            reply_to: command.reply_to.clone(),
            batch_id,
            last_error_type: None,
            last_error_code: None,
            last_error_msg: None,
            created_at: command.created_at,
            updated_at: command.created_at,
        }
    }
}

/// A command awaiting operator action, joined with its archived payload.
#[derive(Debug, Clone)]
pub struct TroubleshootingItem {
    pub domain: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error_type: Option<ErrorKind>,
    pub last_error_code: Option<String>,
    pub last_error_msg: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<String>,
    /// Original envelope from `pgmq.a_<queue>`, if still present.
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a multi-command batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::InProgress => "IN_PROGRESS",
            BatchStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BatchStatus::Pending),
            "IN_PROGRESS" => Some(BatchStatus::InProgress),
            "COMPLETED" => Some(BatchStatus::Completed),
            _ => None,
        }
    }
}

/// Metadata for a multi-command submission.
///
/// The outcome counters are materialized as commands finish;
/// `completed_count + canceled_count + in_troubleshooting_count` never
/// exceeds `total_count`.
#[derive(Debug, Clone)]
pub struct BatchMetadata {
    pub domain: String,
    pub batch_id: Uuid,
    pub name: String,
    pub custom_data: Option<Value>,
    pub status: BatchStatus,
    pub total_count: i32,
    pub completed_count: i32,
    pub canceled_count: i32,
    pub in_troubleshooting_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchMetadata {
    /// Fresh metadata for a batch of `total_count` commands.
    pub fn new(domain: &str, batch_id: Uuid, name: &str, custom_data: Option<Value>, total_count: i32) -> Self {
        let now = Utc::now();
        Self {
            domain: domain.to_string(),
            batch_id,
            name: name.to_string(),
            custom_data,
            status: BatchStatus::Pending,
            total_count,
            completed_count: 0,
            canceled_count: 0,
            in_troubleshooting_count: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_queue_name() {
        assert_eq!(command_queue("payments"), "payments__commands");
        assert_eq!(archive_table("payments__commands"), "pgmq.a_payments__commands");
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            CommandStatus::Pending,
            CommandStatus::InProgress,
            CommandStatus::Completed,
            CommandStatus::Failed,
            CommandStatus::Canceled,
            CommandStatus::InTroubleshootingQueue,
        ] {
            assert_eq!(CommandStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CommandStatus::parse("UNKNOWN"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(CommandStatus::Completed.is_terminal());
        assert!(CommandStatus::Canceled.is_terminal());
        assert!(CommandStatus::InTroubleshootingQueue.is_terminal());
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(!CommandStatus::InProgress.is_terminal());
        assert!(!CommandStatus::Failed.is_terminal());
    }

    #[test]
    fn test_command_envelope_round_trip() {
        let command = Command {
            domain: "payments".to_string(),
            command_type: "Debit".to_string(),
            command_id: Uuid::new_v4(),
            data: json!({"amount": 100}),
            correlation_id: Some(Uuid::new_v4()),
            reply_to: Some("payments__replies".to_string()),
            created_at: Utc::now(),
        };

        let encoded = serde_json::to_value(&command).unwrap();
        assert_eq!(encoded["domain"], "payments");
        assert_eq!(encoded["data"]["amount"], 100);

        let decoded: Command = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.command_id, command.command_id);
        assert_eq!(decoded.reply_to, command.reply_to);
    }

    #[test]
    fn test_reply_emits_data_field() {
        let reply = Reply::success(Uuid::new_v4(), None, Some(json!({"ok": true})));
        let encoded = serde_json::to_value(&reply).unwrap();
        assert_eq!(encoded["outcome"], "SUCCESS");
        assert_eq!(encoded["data"]["ok"], true);
        assert!(encoded.get("result").is_none());
    }

    #[test]
    fn test_reply_accepts_legacy_result_field() {
        let raw = json!({
            "command_id": Uuid::new_v4(),
            "correlation_id": null,
            "outcome": "SUCCESS",
            "result": {"total": 7}
        });
        let reply: Reply = serde_json::from_value(raw).unwrap();
        assert_eq!(reply.outcome, ReplyOutcome::Success);
        assert_eq!(reply.data.unwrap()["total"], 7);
    }

    #[test]
    fn test_reply_failed_carries_error() {
        let reply = Reply::failed(Uuid::new_v4(), None, "INSUFFICIENT_FUNDS", "balance too low");
        assert_eq!(reply.outcome, ReplyOutcome::Failed);
        assert_eq!(reply.error_code.as_deref(), Some("INSUFFICIENT_FUNDS"));
        assert!(reply.data.is_none());
    }

    #[test]
    fn test_metadata_from_command() {
        let command = Command {
            domain: "orders".to_string(),
            command_type: "Reserve".to_string(),
            command_id: Uuid::new_v4(),
            data: json!({}),
            correlation_id: None,
            reply_to: None,
            created_at: Utc::now(),
        };
        let meta = CommandMetadata::new(&command, 5, None);
        assert_eq!(meta.status, CommandStatus::Pending);
        assert_eq!(meta.attempts, 0);
        assert_eq!(meta.max_attempts, 5);
        assert_eq!(meta.queue_name, "orders__commands");
        assert!(meta.msg_id.is_none());
    }
}
