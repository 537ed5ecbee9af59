use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;

use trellis_core::{ExecutionRecord, ExecutionState, ExecutionStatus};

/// In-process ledger of execution records, keyed by execution id.
///
/// Runners update a record at every checkpoint and when the run stops;
/// readers get clones.
#[derive(Default)]
pub struct ExecutionBook {
    records: RwLock<HashMap<String, ExecutionRecord>>,
}

impl ExecutionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ExecutionRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(record.id.clone(), record);
    }

    /// Sync the record for `state` (creating a RUNNING one if absent), then
    /// apply `f`. Returns the updated record.
    pub fn update(
        &self,
        state: &ExecutionState,
        f: impl FnOnce(&mut ExecutionRecord),
    ) -> ExecutionRecord {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry(state.execution_id.clone())
            .or_insert_with(|| ExecutionRecord::running(state));
        record.state = state.clone();
        f(record);
        record.clone()
    }

    /// Mark the run FAILED without touching its last synced state.
    pub fn fail(&self, state: &ExecutionState, message: String) -> ExecutionRecord {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry(state.execution_id.clone())
            .or_insert_with(|| ExecutionRecord::running(state));
        record.status = ExecutionStatus::Failed;
        record.error = Some(message);
        record.completed_at = Some(Utc::now());
        record.clone()
    }

    /// Move a PAUSED record to CANCELLED. Returns false for any other status.
    pub fn cancel_paused(&self, execution_id: &str) -> bool {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(execution_id) {
            Some(record) if record.status == ExecutionStatus::Paused => {
                record.status = ExecutionStatus::Cancelled;
                record.completed_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, execution_id: &str) -> Option<ExecutionRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(execution_id).cloned()
    }

    /// Records, optionally only those of one graph, oldest first.
    pub fn list(&self, graph_id: Option<&str>) -> Vec<ExecutionRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<ExecutionRecord> = records
            .values()
            .filter(|r| graph_id.map_or(true, |g| r.graph_id == g))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        list
    }
}
