use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use graphflow_core::execution::ExecutionStatus;
use graphflow_core::types::Usage;

/// Process-wide execution counters. Written only through the tracker.
#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    nodes_executed: AtomicU64,
    node_failures: AtomicU64,
    retries: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    /// Cost in micro-dollars, so it fits an atomic integer.
    cost_micros: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Executions started but not yet finished.
    pub in_flight: u64,
    pub nodes_executed: u64,
    pub node_failures: u64,
    pub retries: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_node(&self) {
        self.nodes_executed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_node_failure(&self) {
        self.node_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a finished execution and its total usage.
    pub(crate) fn record_finished(&self, status: ExecutionStatus, usage: &Usage) {
        let counter = match status {
            ExecutionStatus::Completed => &self.completed,
            ExecutionStatus::Cancelled => &self.cancelled,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.input_tokens
            .fetch_add(usage.input_tokens, Ordering::SeqCst);
        self.output_tokens
            .fetch_add(usage.output_tokens, Ordering::SeqCst);
        if usage.cost_usd.is_finite() && usage.cost_usd > 0.0 {
            self.cost_micros
                .fetch_add((usage.cost_usd * 1_000_000.0).round() as u64, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let started = self.started.load(Ordering::SeqCst);
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let cancelled = self.cancelled.load(Ordering::SeqCst);
        MetricsSnapshot {
            started,
            completed,
            failed,
            cancelled,
            in_flight: started.saturating_sub(completed + failed + cancelled),
            nodes_executed: self.nodes_executed.load(Ordering::SeqCst),
            node_failures: self.node_failures.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            input_tokens: self.input_tokens.load(Ordering::SeqCst),
            output_tokens: self.output_tokens.load(Ordering::SeqCst),
            cost_usd: self.cost_micros.load(Ordering::SeqCst) as f64 / 1_000_000.0,
        }
    }
}
