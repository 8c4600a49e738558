//! In-memory stores for tests.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgConnection;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::ReplyOutcome;
use crate::process::{NewProcessAuditEntry, ProcessAuditEntry, ProcessMetadata};
use crate::storage::{ProcessStore, Result};

/// In-memory [`ProcessStore`] for unit-testing sagas without a database.
///
/// Connection arguments are ignored; there is no transactionality.
#[derive(Default)]
pub struct MemoryProcessStore {
    processes: Mutex<Vec<ProcessMetadata>>,
    entries: Mutex<Vec<ProcessAuditEntry>>,
}

impl MemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored audit entries, oldest first.
    pub fn all_entries(&self) -> Vec<ProcessAuditEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessStore for MemoryProcessStore {
    async fn save(&self, process: &ProcessMetadata, _conn: Option<&mut PgConnection>) -> Result<()> {
        self.processes.lock().unwrap().push(process.clone());
        Ok(())
    }

    async fn get(
        &self,
        domain: &str,
        process_id: Uuid,
        _conn: Option<&mut PgConnection>,
    ) -> Result<Option<ProcessMetadata>> {
        Ok(self
            .processes
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.domain == domain && p.process_id == process_id)
            .cloned())
    }

    async fn get_by_id(
        &self,
        process_id: Uuid,
        _conn: Option<&mut PgConnection>,
    ) -> Result<Option<ProcessMetadata>> {
        Ok(self
            .processes
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.process_id == process_id)
            .cloned())
    }

    async fn update(&self, process: &ProcessMetadata, _conn: Option<&mut PgConnection>) -> Result<()> {
        let mut processes = self.processes.lock().unwrap();
        if let Some(existing) = processes
            .iter_mut()
            .find(|p| p.domain == process.domain && p.process_id == process.process_id)
        {
            *existing = process.clone();
        }
        Ok(())
    }

    async fn append_step(
        &self,
        entry: &NewProcessAuditEntry,
        _conn: Option<&mut PgConnection>,
    ) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry_id = entries.len() as i64 + 1;
        entries.push(ProcessAuditEntry {
            entry_id,
            domain: entry.domain.clone(),
            process_id: entry.process_id,
            step_name: entry.step_name.clone(),
            command_id: entry.command_id,
            command_type: entry.command_type.clone(),
            command_data: entry.command_data.clone(),
            sent_at: Utc::now(),
            reply_outcome: None,
            reply_data: None,
            received_at: None,
        });
        Ok(())
    }

    async fn record_reply(
        &self,
        domain: &str,
        process_id: Uuid,
        step_name: &str,
        outcome: ReplyOutcome,
        reply_data: Option<&Value>,
        _conn: Option<&mut PgConnection>,
    ) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries
            .iter_mut()
            .rev()
            .find(|e| e.domain == domain && e.process_id == process_id && e.step_name == step_name)
        {
            entry.reply_outcome = Some(outcome);
            entry.reply_data = reply_data.cloned();
            entry.received_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn completed_steps(
        &self,
        domain: &str,
        process_id: Uuid,
        _conn: Option<&mut PgConnection>,
    ) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|e| {
                e.domain == domain
                    && e.process_id == process_id
                    && e.reply_outcome == Some(ReplyOutcome::Success)
            })
            .map(|e| e.step_name.clone())
            .collect())
    }

    async fn entries(
        &self,
        domain: &str,
        process_id: Uuid,
        _conn: Option<&mut PgConnection>,
    ) -> Result<Vec<ProcessAuditEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.domain == domain && e.process_id == process_id)
            .cloned()
            .collect())
    }
}
