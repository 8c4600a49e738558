//! Table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Schema all command-bus tables live in.
#[derive(Iden)]
pub enum Db {
    #[iden = "commandbus"]
    Schema,
}

/// `commandbus.command` — canonical per-command metadata.
#[derive(Iden)]
pub enum Commands {
    #[iden = "command"]
    Table,
    #[iden = "domain"]
    Domain,
    #[iden = "command_id"]
    CommandId,
    #[iden = "command_type"]
    CommandType,
    #[iden = "status"]
    Status,
    #[iden = "attempts"]
    Attempts,
    #[iden = "max_attempts"]
    MaxAttempts,
    #[iden = "msg_id"]
    MsgId,
    #[iden = "queue_name"]
    QueueName,
    #[iden = "correlation_id"]
    CorrelationId,
    #[iden = "reply_queue"]
    ReplyQueue,
    #[iden = "batch_id"]
    BatchId,
    #[iden = "last_error_type"]
    LastErrorType,
    #[iden = "last_error_code"]
    LastErrorCode,
    #[iden = "last_error_msg"]
    LastErrorMsg,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// `commandbus.audit` — append-only command event log.
#[derive(Iden)]
pub enum Audit {
    #[iden = "audit"]
    Table,
    #[iden = "audit_id"]
    AuditId,
    #[iden = "domain"]
    Domain,
    #[iden = "command_id"]
    CommandId,
    #[iden = "event_type"]
    EventType,
    #[iden = "ts"]
    Ts,
    #[iden = "details_json"]
    DetailsJson,
}

/// `commandbus.batch` — multi-command submission metadata.
#[derive(Iden)]
pub enum Batches {
    #[iden = "batch"]
    Table,
    #[iden = "domain"]
    Domain,
    #[iden = "batch_id"]
    BatchId,
    #[iden = "name"]
    Name,
    #[iden = "custom_data"]
    CustomData,
    #[iden = "status"]
    Status,
    #[iden = "total_count"]
    TotalCount,
    #[iden = "completed_count"]
    CompletedCount,
    #[iden = "canceled_count"]
    CanceledCount,
    #[iden = "in_troubleshooting_count"]
    InTroubleshootingCount,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "started_at"]
    StartedAt,
    #[iden = "completed_at"]
    CompletedAt,
}

/// `commandbus.process` — saga state.
#[derive(Iden)]
pub enum Processes {
    #[iden = "process"]
    Table,
    #[iden = "domain"]
    Domain,
    #[iden = "process_id"]
    ProcessId,
    #[iden = "process_type"]
    ProcessType,
    #[iden = "status"]
    Status,
    #[iden = "current_step"]
    CurrentStep,
    #[iden = "state"]
    State,
    #[iden = "error_code"]
    ErrorCode,
    #[iden = "error_message"]
    ErrorMessage,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
    #[iden = "completed_at"]
    CompletedAt,
}

/// `commandbus.process_audit` — one row per saga step.
#[derive(Iden)]
pub enum ProcessAudit {
    #[iden = "process_audit"]
    Table,
    #[iden = "entry_id"]
    EntryId,
    #[iden = "domain"]
    Domain,
    #[iden = "process_id"]
    ProcessId,
    #[iden = "step_name"]
    StepName,
    #[iden = "command_id"]
    CommandId,
    #[iden = "command_type"]
    CommandType,
    #[iden = "command_data"]
    CommandData,
    #[iden = "sent_at"]
    SentAt,
    #[iden = "reply_outcome"]
    ReplyOutcome,
    #[iden = "reply_data"]
    ReplyData,
    #[iden = "received_at"]
    ReceivedAt,
}
