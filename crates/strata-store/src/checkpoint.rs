use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use strata_core::error::{Result, StrataError};
use strata_core::traits::CheckpointStore;
use strata_core::types::{
    Checkpoint, CheckpointKind, Condition, Execution, ExecutionId, ExecutionStatus, SessionId,
};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        condition TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        input TEXT NOT NULL,
        result TEXT,
        error TEXT,
        steps_completed INTEGER NOT NULL DEFAULT 0,
        checkpoints_written INTEGER NOT NULL DEFAULT 0,
        tool_calls INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_executions_session
        ON executions(session_id, started_at DESC);

    CREATE TABLE IF NOT EXISTS checkpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        execution_id TEXT NOT NULL,
        step INTEGER NOT NULL,
        kind TEXT NOT NULL,
        node_id TEXT,
        state TEXT NOT NULL,
        created_at TEXT NOT NULL,
        elapsed_ms INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_checkpoints_execution
        ON checkpoints(execution_id, step, id);";

fn db_err(e: impl std::fmt::Display) -> StrataError {
    StrataError::CheckpointStore(e.to_string())
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| db_err(format!("corrupt timestamp '{s}': {e}")))
}

/// Durable checkpoint history and execution summaries backed by SQLite.
///
/// Checkpoints are append-only; duplicates from retried flushes are kept.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StrataError::CheckpointStore(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Checkpoint store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Total number of stored checkpoints for one execution.
    pub fn count(&self, execution: &ExecutionId) -> Result<usize> {
        let conn = self.conn.lock().map_err(db_err)?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM checkpoints WHERE execution_id = ?1",
                params![execution.0],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(n as usize)
    }
}

fn row_to_checkpoint(row: &Row<'_>) -> rusqlite::Result<(String, i64, String, Option<String>, String, String, Option<i64>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<ExecutionRow> {
    Ok(ExecutionRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        condition: row.get(2)?,
        status: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        input: row.get(6)?,
        result: row.get(7)?,
        error: row.get(8)?,
        steps_completed: row.get(9)?,
        checkpoints_written: row.get(10)?,
        tool_calls: row.get(11)?,
    })
}

struct ExecutionRow {
    id: String,
    session_id: String,
    condition: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    input: String,
    result: Option<String>,
    error: Option<String>,
    steps_completed: i64,
    checkpoints_written: i64,
    tool_calls: i64,
}

impl ExecutionRow {
    fn into_execution(self) -> Result<Execution> {
        let condition = Condition::parse(&self.condition)
            .ok_or_else(|| db_err(format!("unknown condition '{}'", self.condition)))?;
        let status = ExecutionStatus::parse(&self.status)
            .ok_or_else(|| db_err(format!("unknown status '{}'", self.status)))?;
        Ok(Execution {
            id: ExecutionId(self.id),
            session_id: SessionId(self.session_id),
            condition,
            status,
            started_at: parse_ts(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            input: serde_json::from_str(&self.input)?,
            result: self.result.as_deref().map(serde_json::from_str::<serde_json::Value>).transpose()?,
            error: self.error,
            steps_completed: self.steps_completed as u64,
            checkpoints_written: self.checkpoints_written as u64,
            tool_calls: self.tool_calls as u64,
        })
    }
}

const EXECUTION_COLUMNS: &str = "id, session_id, condition, status, started_at, completed_at, input, result, error, steps_completed, checkpoints_written, tool_calls";

impl CheckpointStore for SqliteCheckpointStore {
    fn append(&self, checkpoints: &[Checkpoint]) -> BoxFuture<'_, Result<usize>> {
        let rows: Vec<_> = checkpoints
            .iter()
            .map(|cp| {
                (
                    cp.execution_id.0.clone(),
                    cp.step as i64,
                    cp.kind.as_str().to_string(),
                    cp.node_id.clone(),
                    cp.state.to_string(),
                    format_ts(&cp.created_at),
                    cp.elapsed_ms.map(|ms| ms as i64),
                )
            })
            .collect();

        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            for (execution_id, step, kind, node_id, state, created_at, elapsed_ms) in &rows {
                tx.execute(
                    "INSERT INTO checkpoints (execution_id, step, kind, node_id, state, created_at, elapsed_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![execution_id, step, kind, node_id, state, created_at, elapsed_ms],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(rows.len())
        })
    }

    fn history(
        &self,
        execution: &ExecutionId,
        limit: Option<usize>,
    ) -> BoxFuture<'_, Result<Vec<Checkpoint>>> {
        let execution = execution.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;

            // With a limit, take the newest rows and flip them back into step order
            let (sql, limit) = match limit {
                Some(n) => (
                    "SELECT execution_id, step, kind, node_id, state, created_at, elapsed_ms
                     FROM checkpoints WHERE execution_id = ?1
                     ORDER BY step DESC, id DESC LIMIT ?2",
                    n as i64,
                ),
                None => (
                    "SELECT execution_id, step, kind, node_id, state, created_at, elapsed_ms
                     FROM checkpoints WHERE execution_id = ?1
                     ORDER BY step ASC, id ASC LIMIT ?2",
                    -1,
                ),
            };

            let mut stmt = conn.prepare(sql).map_err(db_err)?;
            let rows = stmt
                .query_map(params![execution, limit], row_to_checkpoint)
                .map_err(db_err)?;

            let mut checkpoints = Vec::new();
            for row in rows {
                let (execution_id, step, kind, node_id, state, created_at, elapsed_ms) =
                    row.map_err(db_err)?;
                let kind = CheckpointKind::parse(&kind)
                    .ok_or_else(|| db_err(format!("unknown checkpoint kind '{kind}'")))?;
                checkpoints.push(Checkpoint {
                    execution_id: ExecutionId(execution_id),
                    step: step as u64,
                    kind,
                    node_id,
                    state: serde_json::from_str(&state)?,
                    created_at: parse_ts(&created_at)?,
                    elapsed_ms: elapsed_ms.map(|ms| ms as u64),
                });
            }

            if limit >= 0 {
                checkpoints.reverse();
            }
            Ok(checkpoints)
        })
    }

    fn save_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let e = execution.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO executions (id, session_id, condition, status, started_at, completed_at, input, result, error, steps_completed, checkpoints_written, tool_calls)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    completed_at = excluded.completed_at,
                    result = excluded.result,
                    error = excluded.error,
                    steps_completed = excluded.steps_completed,
                    checkpoints_written = excluded.checkpoints_written,
                    tool_calls = excluded.tool_calls",
                params![
                    e.id.0,
                    e.session_id.0,
                    e.condition.as_str(),
                    e.status.as_str(),
                    format_ts(&e.started_at),
                    e.completed_at.as_ref().map(format_ts),
                    e.input.to_string(),
                    e.result.as_ref().map(|r| r.to_string()),
                    e.error,
                    e.steps_completed as i64,
                    e.checkpoints_written as i64,
                    e.tool_calls as i64,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let row = conn
                .query_row(
                    &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
                    params![id],
                    row_to_execution,
                )
                .optional()
                .map_err(db_err)?;
            row.map(ExecutionRow::into_execution).transpose()
        })
    }

    fn list_executions(
        &self,
        session: &SessionId,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Execution>>> {
        let session = session.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions
                     WHERE session_id = ?1
                     ORDER BY started_at DESC, rowid DESC
                     LIMIT ?2"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![session, limit as i64], row_to_execution)
                .map_err(db_err)?;

            let mut executions = Vec::new();
            for row in rows {
                executions.push(row.map_err(db_err)?.into_execution()?);
            }
            Ok(executions)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(id: &ExecutionId, step: u64, kind: CheckpointKind) -> Checkpoint {
        Checkpoint {
            execution_id: id.clone(),
            step,
            kind,
            node_id: None,
            state: serde_json::json!({ "step": step }),
            created_at: Utc::now(),
            elapsed_ms: Some(step * 10),
        }
    }

    #[tokio::test]
    async fn test_append_and_history_in_step_order() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let id = ExecutionId::new();
        let batch = vec![
            checkpoint(&id, 0, CheckpointKind::ExecutionStart),
            checkpoint(&id, 2, CheckpointKind::NodeEnd),
            checkpoint(&id, 1, CheckpointKind::NodeStart),
        ];
        assert_eq!(store.append(&batch).await.unwrap(), 3);

        let history = store.history(&id, None).await.unwrap();
        let steps: Vec<u64> = history.iter().map(|cp| cp.step).collect();
        assert_eq!(steps, vec![0, 1, 2]);
        assert_eq!(history[1].kind, CheckpointKind::NodeStart);
        assert_eq!(history[2].state, serde_json::json!({ "step": 2 }));
    }

    #[tokio::test]
    async fn test_history_limit_keeps_latest() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let id = ExecutionId::new();
        let batch: Vec<_> = (0..6)
            .map(|step| checkpoint(&id, step, CheckpointKind::NodeEnd))
            .collect();
        store.append(&batch).await.unwrap();

        let tail = store.history(&id, Some(2)).await.unwrap();
        let steps: Vec<u64> = tail.iter().map(|cp| cp.step).collect();
        assert_eq!(steps, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_duplicates_are_kept() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let id = ExecutionId::new();
        let cp = checkpoint(&id, 1, CheckpointKind::NodeEnd);
        store.append(std::slice::from_ref(&cp)).await.unwrap();
        store.append(std::slice::from_ref(&cp)).await.unwrap();
        assert_eq!(store.count(&id).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_history_isolated_per_execution() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let a = ExecutionId::new();
        let b = ExecutionId::new();
        store
            .append(&[checkpoint(&a, 0, CheckpointKind::ExecutionStart)])
            .await
            .unwrap();
        assert!(store.history(&b, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_update_execution() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let mut exec = Execution::new(
            SessionId::from_string("s1"),
            Condition::Declared,
            serde_json::json!({ "values": [1, 2, 3] }),
        );
        store.save_execution(&exec).await.unwrap();

        exec.status = ExecutionStatus::Completed;
        exec.completed_at = Some(Utc::now());
        exec.result = Some(serde_json::json!({ "ok": true }));
        exec.steps_completed = 4;
        store.save_execution(&exec).await.unwrap();

        let loaded = store.load_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.steps_completed, 4);
        assert_eq!(loaded.result, Some(serde_json::json!({ "ok": true })));
        assert_eq!(loaded.input, serde_json::json!({ "values": [1, 2, 3] }));
        assert!(store.load_execution(&ExecutionId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_executions_most_recent_first() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let session = SessionId::from_string("s1");
        let mut first = Execution::new(session.clone(), Condition::Declared, serde_json::Value::Null);
        first.started_at = Utc::now() - chrono::Duration::seconds(10);
        let second = Execution::new(session.clone(), Condition::Autonomous, serde_json::Value::Null);
        let other = Execution::new(SessionId::from_string("s2"), Condition::Declared, serde_json::Value::Null);
        for e in [&first, &second, &other] {
            store.save_execution(e).await.unwrap();
        }

        let listed = store.list_executions(&session, 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_store_error() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let id = ExecutionId::new();
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO checkpoints (execution_id, step, kind, node_id, state, created_at, elapsed_ms)
                 VALUES (?1, 0, 'execution_start', NULL, '{}', 'yesterday', NULL)",
                params![id.0],
            )
            .unwrap();

        let err = store.history(&id, None).await.unwrap_err();
        assert!(matches!(err, StrataError::CheckpointStore(_)));
        assert!(err.to_string().contains("yesterday"));
    }

    #[tokio::test]
    async fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("strata.db");
        let id = ExecutionId::new();
        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            store
                .append(&[checkpoint(&id, 0, CheckpointKind::ExecutionStart)])
                .await
                .unwrap();
        }
        let reopened = SqliteCheckpointStore::open(&path).unwrap();
        assert_eq!(reopened.history(&id, None).await.unwrap().len(), 1);
    }
}
