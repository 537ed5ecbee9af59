use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::CheckpointStore;
use trellis_core::ExecutionState;

/// Persistent checkpoint store backed by SQLite.
///
/// One row per execution; each save replaces the previous snapshot.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

fn db_err(context: &str, e: impl std::fmt::Display) -> TrellisError {
    TrellisError::Database(format!("{}: {}", context, e))
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err("Failed to create checkpoint directory", e))?;
        }

        let conn =
            Connection::open(path).map_err(|e| db_err("Failed to open checkpoint store", e))?;
        Self::init(conn)
    }

    /// An in-memory database. Snapshots live as long as the store.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| db_err("Failed to open checkpoint store", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 execution_id TEXT PRIMARY KEY,
                 graph_id TEXT NOT NULL,
                 step INTEGER NOT NULL DEFAULT 0,
                 state_json TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_cp_graph
                 ON checkpoints(graph_id);",
        )
        .map_err(|e| db_err("Failed to initialize checkpoint schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, execution_id: &str, state: &ExecutionState) -> Result<()> {
        let state_json = serde_json::to_string(state)?;
        let conn = self.conn.lock().map_err(|e| db_err("Lock poisoned", e))?;
        conn.execute(
            "INSERT INTO checkpoints (execution_id, graph_id, step, state_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(execution_id) DO UPDATE SET
                 graph_id = excluded.graph_id,
                 step = excluded.step,
                 state_json = excluded.state_json,
                 updated_at = excluded.updated_at",
            params![
                execution_id,
                state.graph_id,
                state.steps as i64,
                state_json,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| db_err("Failed to save checkpoint", e))?;
        Ok(())
    }

    fn load(&self, execution_id: &str) -> Result<ExecutionState> {
        let conn = self.conn.lock().map_err(|e| db_err("Lock poisoned", e))?;
        let state_json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM checkpoints WHERE execution_id = ?1",
                params![execution_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("Failed to load checkpoint", e))?;

        match state_json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(TrellisError::CheckpointNotFound(execution_id.to_string())),
        }
    }

    fn delete(&self, execution_id: &str) -> Result<bool> {
        let conn = self.conn.lock().map_err(|e| db_err("Lock poisoned", e))?;
        let deleted = conn
            .execute(
                "DELETE FROM checkpoints WHERE execution_id = ?1",
                params![execution_id],
            )
            .map_err(|e| db_err("Failed to delete checkpoint", e))?;
        Ok(deleted > 0)
    }

    fn list(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(|e| db_err("Lock poisoned", e))?;
        let mut stmt = conn
            .prepare("SELECT execution_id FROM checkpoints ORDER BY execution_id")
            .map_err(|e| db_err("Failed to prepare query", e))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| db_err("Failed to list checkpoints", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_err("Failed to read checkpoint row", e))?;
        Ok(ids)
    }
}
