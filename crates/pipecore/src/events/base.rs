use crate::{ExecutionState, IterationPath};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type SessionId = Uuid;

/// Events emitted while a pipeline runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    RunStarted {
        session_id: SessionId,
        node_count: usize,
        timestamp: DateTime<Utc>,
    },
    GraphStarted {
        session_id: SessionId,
        graph_id: String,
        iteration_path: IterationPath,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        session_id: SessionId,
        node_id: String,
        timestamp: DateTime<Utc>,
    },
    NodeFinished {
        session_id: SessionId,
        node_id: String,
        state: ExecutionState,
        error: Option<String>,
        duration_ms: i64,
        timestamp: DateTime<Utc>,
    },
    RunAborted {
        session_id: SessionId,
        failed: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        session_id: SessionId,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for execution events. Sending never blocks and is a no-op
/// without subscribers.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
