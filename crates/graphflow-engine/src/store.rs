use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use graphflow_core::error::{FlowError, Result};
use graphflow_core::execution::ExecutionRecord;
use graphflow_core::traits::ExecutionStore;
use graphflow_core::types::ExecutionId;

/// Process-local execution store. Records live as long as the store.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<String, ExecutionRecord>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned(e: impl std::fmt::Display) -> FlowError {
    FlowError::Database(format!("store lock poisoned: {}", e))
}

impl ExecutionStore for InMemoryExecutionStore {
    fn create(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            let mut records = self.records.write().map_err(poisoned)?;
            let id = record.execution_id.0.clone();
            if records.contains_key(&id) {
                return Err(FlowError::Database(format!("execution {} already exists", id)));
            }
            records.insert(id, record);
            Ok(())
        })
    }

    fn update(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            let mut records = self.records.write().map_err(poisoned)?;
            match records.get_mut(&record.execution_id.0) {
                Some(slot) => {
                    *slot = record;
                    Ok(())
                }
                None => Err(FlowError::RecordNotFound(record.execution_id.0)),
            }
        })
    }

    fn get(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        let id = id.clone();
        Box::pin(async move {
            let records = self.records.read().map_err(poisoned)?;
            Ok(records.get(&id.0).cloned())
        })
    }

    fn list_recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        Box::pin(async move {
            let records = self.records.read().map_err(poisoned)?;
            let mut all: Vec<ExecutionRecord> = records.values().cloned().collect();
            all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all.truncate(limit);
            Ok(all)
        })
    }

    fn count_started_since(
        &self,
        caller_id: &str,
        since: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<usize>> {
        let caller_id = caller_id.to_string();
        Box::pin(async move {
            let records = self.records.read().map_err(poisoned)?;
            Ok(records
                .values()
                .filter(|r| r.caller_id.as_deref() == Some(caller_id.as_str()) && r.started_at >= since)
                .count())
        })
    }
}
