//! Lifecycle façade over the execution store, metrics and the event bus.
//!
//! `Tracker::start` is the only way to obtain a `TrackedRun`, and the two
//! terminal calls (`complete`, `fail`) consume it. An execution is therefore
//! started once and finished once; nothing else writes to the store, the
//! metrics or the bus on the execution's behalf.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use graphflow_core::context::ExecutionContext;
use graphflow_core::event::EventBus;
use graphflow_core::execution::{ExecutionRecord, ExecutionResult, ExecutionStatus};
use graphflow_core::traits::ExecutionStore;
use graphflow_core::types::{CorrelationId, EventKind, ExecutionEvent, ExecutionId};

use crate::metrics::ExecutionMetrics;

#[derive(Clone)]
pub struct Tracker {
    store: Arc<dyn ExecutionStore>,
    bus: Arc<EventBus>,
    metrics: Arc<ExecutionMetrics>,
}

impl Tracker {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        bus: Arc<EventBus>,
        metrics: Arc<ExecutionMetrics>,
    ) -> Self {
        Self {
            store,
            bus,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<ExecutionMetrics> {
        &self.metrics
    }

    /// Persist the new record as RUNNING, start the timer and announce the run.
    pub async fn start(&self, mut record: ExecutionRecord) -> TrackedRun {
        let now = Utc::now();
        record.status = ExecutionStatus::Running;
        record.started_at = now;
        record.updated_at = now;

        if let Err(e) = self.store.create(&record).await {
            warn!(execution_id = %record.execution_id, error = %e, "Failed to persist execution record");
        }
        self.metrics.record_started();
        self.bus.publish(ExecutionEvent::new(
            &record.execution_id,
            &record.correlation_id,
            EventKind::Started,
            json!({
                "workflow_kind": record.workflow_kind.as_str(),
                "source_id": record.source_id,
            }),
        ));
        info!(
            execution_id = %record.execution_id,
            correlation_id = %record.correlation_id,
            "Execution started"
        );

        TrackedRun {
            tracker: self.clone(),
            record,
            timer: Instant::now(),
        }
    }
}

/// An execution between `start` and its terminal call.
pub struct TrackedRun {
    tracker: Tracker,
    record: ExecutionRecord,
    timer: Instant,
}

impl TrackedRun {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.record.execution_id
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.record.correlation_id
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.timer.elapsed().as_millis() as u64
    }

    fn emit(&self, kind: EventKind, data: serde_json::Value) {
        self.tracker.bus.publish(ExecutionEvent::new(
            &self.record.execution_id,
            &self.record.correlation_id,
            kind,
            data,
        ));
    }

    pub fn node_started(&self, node_id: &str) {
        self.emit(
            EventKind::NodeStarted {
                node_id: node_id.to_string(),
            },
            serde_json::Value::Null,
        );
    }

    pub fn node_failed(&self, node_id: &str, error: &str) {
        self.tracker.metrics.record_node_failure();
        self.emit(
            EventKind::NodeFailed {
                node_id: node_id.to_string(),
                error: error.to_string(),
            },
            serde_json::Value::Null,
        );
    }

    pub fn retrying(&self, node_id: &str, attempt: u32, delay_ms: u64) {
        self.tracker.metrics.record_retry();
        self.emit(
            EventKind::NodeRetrying {
                node_id: node_id.to_string(),
                attempt,
                delay_ms,
            },
            serde_json::Value::Null,
        );
    }

    /// Record a merged node: update the durable record and emit a node event.
    pub async fn checkpoint(&mut self, ctx: &ExecutionContext, node_id: &str, elapsed_ms: u64) {
        self.tracker.metrics.record_node();
        self.sync_from(ctx);
        if let Err(e) = self.tracker.store.update(&self.record).await {
            warn!(execution_id = %self.record.execution_id, node_id, error = %e, "Checkpoint failed");
        }
        debug!(execution_id = %self.record.execution_id, node_id, elapsed_ms, "Checkpoint");
        self.emit(
            EventKind::NodeCompleted {
                node_id: node_id.to_string(),
                elapsed_ms,
            },
            json!({"tokens": ctx.usage.total_tokens()}),
        );
    }

    /// Terminal call for a successful run.
    pub async fn complete(mut self, ctx: &ExecutionContext, result: &ExecutionResult) {
        self.sync_from(ctx);
        self.record.output = Some(json!({
            "text": result.output,
            "payload": result.payload,
        }));
        self.finish(ExecutionStatus::Completed, None).await;
        self.emit(
            EventKind::Completed,
            json!({
                "tokens_used": result.usage.tokens_used,
                "cost_usd": result.usage.cost_usd,
                "execution_time_ms": self.record.execution_time_ms,
            }),
        );
        info!(
            execution_id = %self.record.execution_id,
            elapsed_ms = self.record.execution_time_ms,
            tokens = result.usage.tokens_used,
            "Execution completed"
        );
    }

    /// Terminal call for a failed or cancelled run.
    pub async fn fail(mut self, ctx: &ExecutionContext, status: ExecutionStatus, error: &str) {
        let status = if status == ExecutionStatus::Cancelled {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Failed
        };
        self.sync_from(ctx);
        if let Some(text) = &ctx.final_output {
            self.record.output = Some(json!({"text": text}));
        }
        self.finish(status, Some(error.to_string())).await;
        self.emit(
            EventKind::Failed {
                error: error.to_string(),
            },
            json!({
                "status": status.as_str(),
                "execution_time_ms": self.record.execution_time_ms,
            }),
        );
        warn!(
            execution_id = %self.record.execution_id,
            status = %status,
            error,
            "Execution did not complete"
        );
    }

    fn sync_from(&mut self, ctx: &ExecutionContext) {
        self.record.usage = ctx.usage;
        self.record.history = ctx.history.clone();
        self.record.log = ctx.log.clone();
        self.record.execution_time_ms = self.elapsed_ms();
        self.record.updated_at = Utc::now();
    }

    async fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        let now = Utc::now();
        self.record.status = status;
        self.record.error = error;
        self.record.finished_at = Some(now);
        self.record.updated_at = now;
        self.record.execution_time_ms = self.elapsed_ms();
        if let Err(e) = self.tracker.store.update(&self.record).await {
            warn!(execution_id = %self.record.execution_id, error = %e, "Failed to persist final record");
        }
        self.tracker
            .metrics
            .record_finished(status, &self.record.usage);
    }
}
