pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use trellis_core::config::{CheckpointBackend, CheckpointConfig};
use trellis_core::error::Result;
use trellis_core::traits::CheckpointStore;

pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// Open the checkpoint store selected by `config`.
pub fn open_store(config: &CheckpointConfig) -> Result<Arc<dyn CheckpointStore>> {
    match config.backend {
        CheckpointBackend::Memory => Ok(Arc::new(MemoryCheckpointStore::new())),
        CheckpointBackend::Sqlite => {
            let path = config.resolved_path();
            tracing::info!(path = %path.display(), "Opening SQLite checkpoint store");
            Ok(Arc::new(SqliteCheckpointStore::open(&path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{ExecutionState, Variables};

    #[test]
    fn test_open_memory_by_default() {
        let store = open_store(&CheckpointConfig::default()).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_open_sqlite_from_config() {
        let dir = trellis_test_utils::temp_dir();
        let config = CheckpointConfig {
            backend: CheckpointBackend::Sqlite,
            path: dir.path().join("nested/cp.db").display().to_string(),
        };
        let store = open_store(&config).unwrap();
        let state = ExecutionState::new("g", Variables::new(), 10);
        store.save(&state.execution_id, &state).unwrap();
        assert_eq!(store.list().unwrap(), vec![state.execution_id.clone()]);
    }
}
