use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncOperationStatus {
    Pending,
    Running,
    /// Cancellation requested; the executor still owns the completion.
    Cancelling,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl AsyncOperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AsyncOperationStatus::Succeeded
                | AsyncOperationStatus::Failed
                | AsyncOperationStatus::Cancelled
                | AsyncOperationStatus::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AsyncOperationStatus::Pending => "pending",
            AsyncOperationStatus::Running => "running",
            AsyncOperationStatus::Cancelling => "cancelling",
            AsyncOperationStatus::Succeeded => "succeeded",
            AsyncOperationStatus::Failed => "failed",
            AsyncOperationStatus::Cancelled => "cancelled",
            AsyncOperationStatus::TimedOut => "timed_out",
        }
    }
}

impl From<crate::RunStatus> for AsyncOperationStatus {
    fn from(status: crate::RunStatus) -> Self {
        match status {
            crate::RunStatus::Pending => AsyncOperationStatus::Pending,
            crate::RunStatus::Running => AsyncOperationStatus::Running,
            crate::RunStatus::Succeeded => AsyncOperationStatus::Succeeded,
            crate::RunStatus::Failed => AsyncOperationStatus::Failed,
            crate::RunStatus::Cancelled => AsyncOperationStatus::Cancelled,
            crate::RunStatus::TimedOut => AsyncOperationStatus::TimedOut,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AsyncStatusUpdate {
    pub tool_call_id: String,
    pub status: AsyncOperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub is_terminal: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AsyncCompletionEvent {
    pub tool_call_id: String,
    pub final_status: AsyncOperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AsyncOperation {
    pub tool_call_id: String,
    pub chat_id: String,
    pub tool_name: String,
    pub scenario: String,
    pub status: AsyncOperationStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<AsyncStatusUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AsyncOperation {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
