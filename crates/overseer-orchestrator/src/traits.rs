use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use overseer_types::{
    ApproveRequest, ApproveResult, AsyncOperation, AsyncOperationStatus, Availability,
    CreateSandboxRequest, DiffResult, PlanStep, RunEvent, RunRequest, RunStatus, Sandbox,
    SandboxStatus, StepResult,
};

/// Everything an executor may consult while running one attempt of a step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: String,
    pub step_index: usize,
    pub attempt: u32,
    pub sandbox_id: String,
    pub work_dir: String,
    /// Fires on run cancellation or deadline. Check it at every I/O boundary.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: StepContext, step: &PlanStep) -> StepResult;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SandboxError {
    #[error("sandbox backend unavailable: {0}")]
    Unavailable(String),
    #[error("sandbox transport error: {0}")]
    Transport(String),
    #[error("sandbox misconfigured: {0}")]
    Misconfigured(String),
    #[error("sandbox not found: {0}")]
    NotFound(String),
    #[error("sandbox {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: SandboxStatus,
        to: SandboxStatus,
    },
    #[error("apply failed: {0}")]
    ApplyFailed(String),
}

impl SandboxError {
    /// Transport-class failures are worth a retry; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, SandboxError::Transport(_))
    }
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Idempotent per `idempotency_key`.
    async fn create(&self, request: CreateSandboxRequest) -> Result<Sandbox, SandboxError>;
    async fn get(&self, sandbox_id: &str) -> Result<Sandbox, SandboxError>;
    async fn delete(&self, sandbox_id: &str) -> Result<(), SandboxError>;
    async fn workspace_path(&self, sandbox_id: &str) -> Result<String, SandboxError>;
    async fn get_diff(&self, sandbox_id: &str) -> Result<DiffResult, SandboxError>;
    /// Applies every listed file to the canonical store, or none of them.
    async fn approve(&self, request: ApproveRequest) -> Result<ApproveResult, SandboxError>;
    async fn partial_approve(&self, request: ApproveRequest)
        -> Result<ApproveResult, SandboxError>;
    /// Never touches the canonical store.
    async fn reject(&self, sandbox_id: &str, actor: &str) -> Result<(), SandboxError>;
    async fn stop(&self, sandbox_id: &str) -> Result<(), SandboxError>;
    async fn start(&self, sandbox_id: &str) -> Result<(), SandboxError>;
    async fn is_available(&self) -> Availability;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &RunEvent) -> anyhow::Result<()>;
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create_run(&self, request: &RunRequest, started_at: DateTime<Utc>)
        -> anyhow::Result<()>;
    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> anyhow::Result<()>;
    /// Fails if `(run_id, sequence)` was already stored.
    async fn append_event(&self, event: &RunEvent) -> anyhow::Result<()>;
    async fn load_run(&self, run_id: &str) -> anyhow::Result<Option<StoredRun>>;
    async fn list_events(
        &self,
        run_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<RunEvent>>;
    async fn create_sandbox_record(&self, run_id: &str, sandbox: &Sandbox) -> anyhow::Result<()>;
    async fn update_sandbox_status(
        &self,
        sandbox_id: &str,
        status: SandboxStatus,
    ) -> anyhow::Result<()>;
    async fn record_async_operation(&self, op: &AsyncOperation) -> anyhow::Result<()>;
    async fn mark_operation_terminal(
        &self,
        tool_call_id: &str,
        status: AsyncOperationStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> anyhow::Result<()>;
}

/// Durable view of a run row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRun {
    pub id: String,
    pub scope_path: String,
    pub project_root: String,
    pub owner: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset_used: Option<String>,
}
