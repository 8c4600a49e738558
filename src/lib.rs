//! Durable transactional command bus over PostgreSQL + PGMQ.
//!
//! Producers enqueue commands addressed to a domain; workers consume them,
//! dispatch to registered handlers, and publish replies on per-producer
//! reply queues. Delivery is at-least-once with exactly one terminal
//! outcome per command, bounded retries with explicit backoff, a
//! troubleshooting queue for operator-mediated recovery, and a full audit
//! trail. Process managers coordinate multi-step sagas over the same
//! primitives.

pub mod bus;
pub mod config;
pub mod handlers;
pub mod models;
pub mod pgmq;
pub mod process;
pub mod storage;
pub mod sync;
pub mod tsq;
pub mod utils;
pub mod worker;

pub use bus::{BusError, CommandBus, CommandSender, SendRequest, SendResult};
pub use config::{TimeoutConfig, WorkerConfig};
pub use handlers::{
    CommandHandler, HandlerContext, HandlerError, HandlerOptions, HandlerRegistry,
};
pub use models::{Command, CommandMetadata, CommandStatus, Reply, ReplyOutcome};
pub use process::{
    ProcessDefinition, ProcessManager, ProcessMetadata, ProcessReplyRouter, ProcessStatus,
    ProcessStep,
};
pub use storage::{AuditEvent, AuditEventType, CommandFilter};
pub use tsq::TroubleshootingQueue;
pub use utils::retry::RetryPolicy;
pub use worker::{ReceivedCommand, Worker, WorkerError};
