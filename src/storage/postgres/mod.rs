//! PostgreSQL implementations of the storage traits.

mod audit_log;
mod batch_store;
mod command_store;
mod process_store;

pub use audit_log::PostgresAuditLog;
pub use batch_store::PostgresBatchStore;
pub use command_store::PostgresCommandStore;
pub use process_store::PostgresProcessStore;
