use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use graphflow_core::event::EventBus;
use graphflow_core::types::{EventKind, ExecutionEvent, ExecutionId};

/// JSONL runtime logger.
///
/// Subscribes to the EventBus and writes one JSON object per line for a
/// single execution. Append-only: if the process dies mid-run, every line
/// already written stays intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single line of the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    correlation_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `log_dir` is the base directory; logs go to
    /// `{log_dir}/{execution_id}/{timestamp}.jsonl`.
    /// `level`: 1 = run lifecycle, 2 = + node completions and failures, 3 = + node starts and retries.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now, then write in a background task until the execution's
    /// terminal event or cancellation.
    ///
    /// Subscribing before spawning guarantees the `Started` event is seen.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, execution_id, cancel))
    }

    async fn run(
        self,
        mut rx: broadcast::Receiver<ExecutionEvent>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) {
        let run_dir = self.log_dir.join(&execution_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            // The bus is shared by every execution.
                            if event.execution_id != execution_id {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if event.is_terminal() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Map an event to a log line, or `None` when the level filters it out.
    fn event_to_entry(&self, event: &ExecutionEvent) -> Option<LogEntry> {
        let (event_type, node_id, min_level) = match &event.kind {
            EventKind::Started => ("started", None, 1),
            EventKind::Completed => ("completed", None, 1),
            EventKind::Failed { .. } => ("failed", None, 1),
            EventKind::NodeCompleted { node_id, .. } => ("node_completed", Some(node_id), 2),
            EventKind::NodeFailed { node_id, .. } => ("node_failed", Some(node_id), 2),
            EventKind::NodeStarted { node_id } => ("node_started", Some(node_id), 3),
            EventKind::NodeRetrying { node_id, .. } => ("node_retrying", Some(node_id), 3),
        };
        if self.level < min_level {
            return None;
        }

        let detail = match &event.kind {
            EventKind::Failed { error } => Some(merge_detail(&event.data, "error", error)),
            EventKind::NodeFailed { error, .. } => Some(serde_json::json!({
                "error": truncate_str(error, 500),
            })),
            EventKind::NodeCompleted { elapsed_ms, .. } => {
                Some(merge_detail(&event.data, "elapsed_ms", elapsed_ms))
            }
            EventKind::NodeRetrying {
                attempt, delay_ms, ..
            } => Some(serde_json::json!({
                "attempt": attempt,
                "delay_ms": delay_ms,
            })),
            _ if event.data.is_null() => None,
            _ => Some(event.data.clone()),
        };

        Some(LogEntry {
            timestamp: event.timestamp.to_rfc3339(),
            execution_id: event.execution_id.0.clone(),
            correlation_id: event.correlation_id.0.clone(),
            event_type,
            node_id: node_id.cloned(),
            detail,
        })
    }
}

/// The event's data object with one extra field.
fn merge_detail(data: &serde_json::Value, key: &str, value: impl Serialize) -> serde_json::Value {
    let mut detail = match data {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    detail.insert(
        key.to_string(),
        serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
    );
    serde_json::Value::Object(detail)
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphflow_core::types::CorrelationId;
    use serde_json::json;

    fn event(kind: EventKind) -> ExecutionEvent {
        ExecutionEvent::new(
            &ExecutionId::from_string("e1"),
            &CorrelationId::from_string("c1"),
            kind,
            serde_json::Value::Null,
        )
    }

    #[test]
    fn test_entry_format() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger.event_to_entry(&event(EventKind::Started)).unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"started\""));
        assert!(json.contains("\"execution_id\":\"e1\""));
        assert!(!json.contains("node_id"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_event_level_filtering() {
        let node_completed = event(EventKind::NodeCompleted {
            node_id: "n".into(),
            elapsed_ms: 4,
        });
        let node_started = event(EventKind::NodeStarted { node_id: "n".into() });

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1
            .event_to_entry(&event(EventKind::Failed { error: "x".into() }))
            .is_some());
        assert!(l1.event_to_entry(&node_completed).is_none());
        assert!(l1.event_to_entry(&node_started).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = l2.event_to_entry(&node_completed).unwrap();
        assert_eq!(entry.node_id.as_deref(), Some("n"));
        assert_eq!(entry.detail, Some(json!({"elapsed_ms": 4})));
        assert!(l2.event_to_entry(&node_started).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3.event_to_entry(&node_started).is_some());
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("abc", 10), "abc");
    }

    #[tokio::test]
    async fn test_writes_until_terminal_event() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let eid = ExecutionId::from_string("e1");
        let handle = RunLogger::new(dir.path().to_path_buf(), 3).spawn(
            &bus,
            eid.clone(),
            CancellationToken::new(),
        );

        bus.publish(event(EventKind::Started));
        bus.publish(ExecutionEvent::new(
            &ExecutionId::from_string("other"),
            &CorrelationId::new(),
            EventKind::Started,
            serde_json::Value::Null,
        ));
        bus.publish(event(EventKind::NodeStarted { node_id: "a".into() }));
        bus.publish(event(EventKind::Completed));
        handle.await.unwrap();

        let run_dir = dir.path().join("e1");
        let file = std::fs::read_dir(&run_dir).unwrap().next().unwrap().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let types: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event_type"].to_string())
            .collect();
        assert_eq!(types, vec!["\"started\"", "\"node_started\"", "\"completed\""]);
    }
}
