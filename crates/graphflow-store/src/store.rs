use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use graphflow_core::error::{FlowError, Result};
use graphflow_core::execution::{ExecutionRecord, ExecutionStatus, WorkflowKind};
use graphflow_core::traits::ExecutionStore;
use graphflow_core::types::{CorrelationId, ExecutionId};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS executions (
        execution_id TEXT PRIMARY KEY,
        correlation_id TEXT NOT NULL,
        workflow_kind TEXT NOT NULL,
        source_id TEXT,
        caller_id TEXT,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        finished_at TEXT,
        input TEXT NOT NULL,
        output TEXT,
        usage TEXT NOT NULL,
        execution_time_ms INTEGER NOT NULL,
        history TEXT NOT NULL,
        log TEXT NOT NULL,
        error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_executions_caller
        ON executions(caller_id, started_at);

    CREATE INDEX IF NOT EXISTS idx_executions_started
        ON executions(started_at);";

const COLUMNS: &str = "execution_id, correlation_id, workflow_kind, source_id, caller_id, status,
    started_at, updated_at, finished_at, input, output, usage, execution_time_ms, history, log, error";

/// SQLite-backed durable execution records. Structured fields are JSON columns.
pub struct SqliteExecutionStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> FlowError {
    FlowError::Database(e.to_string())
}

impl SqliteExecutionStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FlowError::Database(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL lets readers proceed while the tracker writes.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Execution store opened");
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
}

/// Fixed-width RFC 3339 so text order matches time order.
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FlowError::Database(format!("bad timestamp '{}': {}", s, e)))
}

/// Column values of one record, in `COLUMNS` order.
struct Columns {
    execution_id: String,
    correlation_id: String,
    workflow_kind: String,
    source_id: Option<String>,
    caller_id: Option<String>,
    status: String,
    started_at: String,
    updated_at: String,
    finished_at: Option<String>,
    input: String,
    output: Option<String>,
    usage: String,
    execution_time_ms: i64,
    history: String,
    log: String,
    error: Option<String>,
}

impl Columns {
    fn from_record(r: &ExecutionRecord) -> Result<Self> {
        Ok(Self {
            execution_id: r.execution_id.0.clone(),
            correlation_id: r.correlation_id.0.clone(),
            workflow_kind: r.workflow_kind.as_str().to_string(),
            source_id: r.source_id.clone(),
            caller_id: r.caller_id.clone(),
            status: r.status.as_str().to_string(),
            started_at: timestamp(&r.started_at),
            updated_at: timestamp(&r.updated_at),
            finished_at: r.finished_at.as_ref().map(timestamp),
            input: serde_json::to_string(&r.input)?,
            output: r.output.as_ref().map(serde_json::to_string).transpose()?,
            usage: serde_json::to_string(&r.usage)?,
            execution_time_ms: r.execution_time_ms as i64,
            history: serde_json::to_string(&r.history)?,
            log: serde_json::to_string(&r.log)?,
            error: r.error.clone(),
        })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            execution_id: row.get(0)?,
            correlation_id: row.get(1)?,
            workflow_kind: row.get(2)?,
            source_id: row.get(3)?,
            caller_id: row.get(4)?,
            status: row.get(5)?,
            started_at: row.get(6)?,
            updated_at: row.get(7)?,
            finished_at: row.get(8)?,
            input: row.get(9)?,
            output: row.get(10)?,
            usage: row.get(11)?,
            execution_time_ms: row.get(12)?,
            history: row.get(13)?,
            log: row.get(14)?,
            error: row.get(15)?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord> {
        let workflow_kind: WorkflowKind =
            serde_json::from_value(serde_json::Value::String(self.workflow_kind))?;
        let status: ExecutionStatus = self.status.parse().map_err(FlowError::Database)?;
        Ok(ExecutionRecord {
            execution_id: ExecutionId(self.execution_id),
            correlation_id: CorrelationId(self.correlation_id),
            workflow_kind,
            source_id: self.source_id,
            caller_id: self.caller_id,
            status,
            started_at: parse_timestamp(&self.started_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            finished_at: self.finished_at.as_deref().map(parse_timestamp).transpose()?,
            input: serde_json::from_str(&self.input)?,
            output: self.output.as_deref().map(serde_json::from_str).transpose()?,
            usage: serde_json::from_str(&self.usage)?,
            execution_time_ms: self.execution_time_ms.max(0) as u64,
            history: serde_json::from_str(&self.history)?,
            log: serde_json::from_str(&self.log)?,
            error: self.error,
        })
    }
}

impl ExecutionStore for SqliteExecutionStore {
    fn create(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let cols = Columns::from_record(record);
        Box::pin(async move {
            let c = cols?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                &format!(
                    "INSERT INTO executions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    COLUMNS
                ),
                params![
                    c.execution_id,
                    c.correlation_id,
                    c.workflow_kind,
                    c.source_id,
                    c.caller_id,
                    c.status,
                    c.started_at,
                    c.updated_at,
                    c.finished_at,
                    c.input,
                    c.output,
                    c.usage,
                    c.execution_time_ms,
                    c.history,
                    c.log,
                    c.error,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn update(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let cols = Columns::from_record(record);
        Box::pin(async move {
            let c = cols?;
            let conn = self.conn.lock().map_err(db_err)?;
            let changed = conn
                .execute(
                    "UPDATE executions SET
                        status = ?2, updated_at = ?3, finished_at = ?4, output = ?5,
                        usage = ?6, execution_time_ms = ?7, history = ?8, log = ?9, error = ?10
                     WHERE execution_id = ?1",
                    params![
                        c.execution_id,
                        c.status,
                        c.updated_at,
                        c.finished_at,
                        c.output,
                        c.usage,
                        c.execution_time_ms,
                        c.history,
                        c.log,
                        c.error,
                    ],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(FlowError::RecordNotFound(c.execution_id));
            }
            Ok(())
        })
    }

    fn get(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        let id = id.0.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let cols = conn
                .query_row(
                    &format!("SELECT {} FROM executions WHERE execution_id = ?1", COLUMNS),
                    params![id],
                    Columns::from_row,
                )
                .optional()
                .map_err(db_err)?;
            cols.map(Columns::into_record).transpose()
        })
    }

    fn list_recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM executions ORDER BY started_at DESC LIMIT ?1",
                    COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![limit as i64], Columns::from_row)
                .map_err(db_err)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(db_err)?.into_record()?);
            }
            Ok(records)
        })
    }

    fn count_started_since(
        &self,
        caller_id: &str,
        since: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<usize>> {
        let caller_id = caller_id.to_string();
        let since = timestamp(&since);
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM executions WHERE caller_id = ?1 AND started_at >= ?2",
                    params![caller_id, since],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(count.max(0) as usize)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphflow_core::execution::{LogEntry, LogLevel};
    use graphflow_core::types::Usage;
    use serde_json::json;

    fn record(id: &str) -> ExecutionRecord {
        let mut r = ExecutionRecord::new(
            ExecutionId::from_string(id),
            CorrelationId::from_string("corr"),
            WorkflowKind::Template,
            Some("t1".into()),
            json!({"text": "Hello"}),
        );
        r.caller_id = Some("alice".into());
        r
    }

    #[tokio::test]
    async fn test_create_update_and_reload() {
        let store = SqliteExecutionStore::in_memory().unwrap();
        let mut r = record("e1");
        store.create(&r).await.unwrap();

        r.status = ExecutionStatus::Completed;
        r.usage = Usage::new(12, 8);
        r.history = vec!["start".into(), "model".into()];
        r.log.push(LogEntry::new(LogLevel::Info, Some("model"), "done"));
        r.output = Some(json!({"text": "Echo: Hello"}));
        r.finished_at = Some(Utc::now());
        store.update(&r).await.unwrap();

        let loaded = store.get(&r.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.workflow_kind, WorkflowKind::Template);
        assert_eq!(loaded.source_id.as_deref(), Some("t1"));
        assert_eq!(loaded.usage.total_tokens(), 20);
        assert_eq!(loaded.history, vec!["start", "model"]);
        assert_eq!(loaded.log[0].message, "done");
        assert_eq!(loaded.output, Some(json!({"text": "Echo: Hello"})));
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_and_missing() {
        let store = SqliteExecutionStore::in_memory().unwrap();
        store.create(&record("e1")).await.unwrap();
        assert!(matches!(
            store.create(&record("e1")).await,
            Err(FlowError::Database(_))
        ));
        assert!(matches!(
            store.update(&record("ghost")).await,
            Err(FlowError::RecordNotFound(id)) if id == "ghost"
        ));
        assert!(store
            .get(&ExecutionId::from_string("ghost"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_count_and_list_recent() {
        let store = SqliteExecutionStore::in_memory().unwrap();
        let mut old = record("old");
        old.started_at = Utc::now() - chrono::Duration::minutes(10);
        store.create(&old).await.unwrap();
        store.create(&record("new")).await.unwrap();
        let mut other = record("other");
        other.caller_id = Some("bob".into());
        store.create(&other).await.unwrap();

        let since = Utc::now() - chrono::Duration::minutes(1);
        assert_eq!(store.count_started_since("alice", since).await.unwrap(), 1);
        assert_eq!(store.count_started_since("carol", since).await.unwrap(), 0);

        let recent = store.list_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|r| r.execution_id.0 != "old"));
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("executions.db");
        {
            let store = SqliteExecutionStore::open(&path).unwrap();
            store.create(&record("e1")).await.unwrap();
        }
        let store = SqliteExecutionStore::open(&path).unwrap();
        assert!(store
            .get(&ExecutionId::from_string("e1"))
            .await
            .unwrap()
            .is_some());
    }
}
