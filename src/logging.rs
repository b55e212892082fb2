//! Run event logging.
//!
//! Phases report structured events (`context_lane_update`, `critic_verdict`, ...)
//! through a [`RunLogger`]. Logging is fire-and-forget: `log` never blocks the
//! calling phase and never fails.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// One logged event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub ts: String,
    pub data: Value,
}

impl RunEvent {
    pub fn new(event_type: &str, data: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            ts: crate::util::now_string(),
            data,
        }
    }
}

/// Sink for structured run events.
pub trait RunLogger: Send + Sync {
    fn log(&self, event_type: &str, data: Value);
}

/// Shared logger handle.
pub type SharedLogger = Arc<dyn RunLogger>;

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRunLogger;

impl RunLogger for NoopRunLogger {
    fn log(&self, _event_type: &str, _data: Value) {}
}

/// Forwards events to `tracing` under the `codeloop::events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunLogger;

impl RunLogger for TracingRunLogger {
    fn log(&self, event_type: &str, data: Value) {
        tracing::info!(target: "codeloop::events", event = event_type, data = %data);
    }
}

/// Keeps events in memory, in emission order.
#[derive(Debug, Default)]
pub struct MemoryRunLogger {
    events: Mutex<Vec<RunEvent>>,
}

impl MemoryRunLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<RunEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Events with the given type.
    pub fn events_of(&self, event_type: &str) -> Vec<RunEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl RunLogger for MemoryRunLogger {
    fn log(&self, event_type: &str, data: Value) {
        let event = RunEvent::new(event_type, data);
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Appends events to a JSONL file from a background task.
///
/// Events are queued on an unbounded channel so `log` returns immediately.
/// Dropping every handle closes the channel and lets the writer task finish.
#[derive(Clone)]
pub struct JsonlRunLogger {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl JsonlRunLogger {
    /// Start the writer task. Must be called from within a tokio runtime.
    pub fn spawn(path: PathBuf) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<RunEvent>();
        let handle = tokio::spawn(async move {
            if let Some(parent) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    tracing::warn!("Failed to create run log dir {}: {}", parent.display(), e);
                }
            }
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!("Failed to open run log {}: {}", path.display(), e);
                    return;
                }
            };
            while let Some(event) = rx.recv().await {
                let mut line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!("Failed to serialize run event: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    tracing::warn!("Failed to write run log {}: {}", path.display(), e);
                }
            }
            let _ = file.flush().await;
        });
        (Self { tx }, handle)
    }
}

impl RunLogger for JsonlRunLogger {
    fn log(&self, event_type: &str, data: Value) {
        if self.tx.send(RunEvent::new(event_type, data)).is_err() {
            tracing::debug!("Run log writer closed; dropping {}", event_type);
        }
    }
}

/// Fans events out to several loggers.
pub struct FanoutRunLogger {
    sinks: Vec<SharedLogger>,
}

impl FanoutRunLogger {
    pub fn new(sinks: Vec<SharedLogger>) -> Self {
        Self { sinks }
    }
}

impl RunLogger for FanoutRunLogger {
    fn log(&self, event_type: &str, data: Value) {
        for sink in &self.sinks {
            sink.log(event_type, data.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_logger_filters_by_type() {
        let logger = MemoryRunLogger::new();
        logger.log("a", json!({"n": 1}));
        logger.log("b", json!({}));
        logger.log("a", json!({"n": 2}));
        let events = logger.events_of("a");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data["n"], 2);
    }

    #[tokio::test]
    async fn jsonl_logger_writes_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs/run.jsonl");
        let (logger, handle) = JsonlRunLogger::spawn(path.clone());
        logger.log("context_lane_update", json!({"laneId": "x"}));
        logger.log("critic_verdict", json!({"status": "PASS"}));
        drop(logger);
        handle.await.expect("writer task");

        let content = tokio::fs::read_to_string(&path).await.expect("read log");
        let events: Vec<RunEvent> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "context_lane_update");
        assert_eq!(events[1].data["status"], "PASS");
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemoryRunLogger::new());
        let b = Arc::new(MemoryRunLogger::new());
        let sinks: Vec<SharedLogger> = vec![a.clone(), b.clone()];
        let fanout = FanoutRunLogger::new(sinks);
        fanout.log("x", json!(null));
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }
}
