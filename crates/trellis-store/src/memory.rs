use std::collections::HashMap;
use std::sync::RwLock;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::CheckpointStore;
use trellis_core::ExecutionState;

/// Process-local checkpoint store. Snapshots are deep copies, so later
/// mutation of a run's state never leaks into a saved checkpoint.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    snapshots: RwLock<HashMap<String, ExecutionState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, execution_id: &str, state: &ExecutionState) -> Result<()> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        snapshots.insert(execution_id.to_string(), state.clone());
        Ok(())
    }

    fn load(&self, execution_id: &str) -> Result<ExecutionState> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        snapshots
            .get(execution_id)
            .cloned()
            .ok_or_else(|| TrellisError::CheckpointNotFound(execution_id.to_string()))
    }

    fn delete(&self, execution_id: &str) -> Result<bool> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(snapshots.remove(execution_id).is_some())
    }

    fn list(&self) -> Result<Vec<String>> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let mut ids: Vec<String> = snapshots.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
