use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable event kind identifiers for run event streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    RunCreated,
    RunStatus,
    RunProgress,
    StepStarted,
    StepCompleted,
    StepFailed,
    ExecutionCompleted,
    ExecutionFailed,
    /// Control event: the subscriber's cursor fell behind the retained ring.
    GapDetected,
}

impl RunEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunEventKind::RunCreated => "run_created",
            RunEventKind::RunStatus => "run_status",
            RunEventKind::RunProgress => "run_progress",
            RunEventKind::StepStarted => "step_started",
            RunEventKind::StepCompleted => "step_completed",
            RunEventKind::StepFailed => "step_failed",
            RunEventKind::ExecutionCompleted => "execution_completed",
            RunEventKind::ExecutionFailed => "execution_failed",
            RunEventKind::GapDetected => "gap_detected",
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, RunEventKind::GapDetected)
    }
}

impl std::fmt::Display for RunEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: String,
    pub sequence: u64,
    pub kind: RunEventKind,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    /// Step index carried by step events.
    pub fn step_index(&self) -> Option<usize> {
        self.payload
            .get("stepIndex")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
    }

    /// Status string carried by `run_status` events.
    pub fn status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }
}
