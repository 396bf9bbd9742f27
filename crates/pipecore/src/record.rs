use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered integers identifying nesting depth and retry count of an execution.
pub type IterationPath = Vec<u32>;

/// Structured payload carried between nodes.
pub type DataMap = Map<String, Value>;

/// Record of one node execution.
///
/// A fresh record is built for every execution and only mutated while that
/// execution runs; stores keep their own copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    pub input_data: DataMap,
    pub output_data: DataMap,
    pub text: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub node_id: String,
    pub session_id: String,
    pub parent_id: Option<String>,
    pub iteration_path: IterationPath,
    /// Cleared by handlers to signal that a sub-graph should iterate again.
    pub success: bool,
}

impl StepData {
    pub fn new(node_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            session_id: session_id.into(),
            success: true,
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn started_now(mut self) -> Self {
        self.start = Some(Utc::now());
        self
    }

    pub fn stamp_end(&mut self) {
        self.end = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Lifecycle of a node executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Initialized,
    InProgress,
    Completed,
    Error,
    ErrorIgnored,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExecutionState::Initialized => "INITIALIZED",
            ExecutionState::InProgress => "IN_PROGRESS",
            ExecutionState::Completed => "COMPLETED",
            ExecutionState::Error => "ERROR",
            ExecutionState::ErrorIgnored => "ERROR_IGNORED",
        };
        f.write_str(label)
    }
}
