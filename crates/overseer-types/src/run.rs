use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    #[default]
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub node_id: String,
    pub step_type: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub retryable: bool,
}

impl PlanStep {
    pub fn new(node_id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            step_type: step_type.into(),
            params: Value::Null,
            retryable: false,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub instructions: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    /// Per-step retry budget; falls back to the engine-wide `maxStepAttempts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_step_attempts: Option<u32>,
}

impl Plan {
    pub fn new(instructions: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            instructions: instructions.into(),
            steps,
            max_step_attempts: None,
        }
    }
}

/// A request to execute a plan against a scope. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub id: String,
    pub scope_path: String,
    pub project_root: String,
    pub owner: String,
    #[serde(default)]
    pub owner_type: OwnerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub plan: Plan,
    /// Scope-lock TTL and run deadline; the engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RunRequest {
    pub fn new(
        scope_path: impl Into<String>,
        project_root: impl Into<String>,
        owner: impl Into<String>,
        plan: Plan,
    ) -> Self {
        Self {
            id: crate::new_id("run"),
            scope_path: scope_path.into(),
            project_root: project_root.into(),
            owner: owner.into(),
            owner_type: OwnerType::User,
            idempotency_key: None,
            plan,
            ttl_ms: None,
            metadata: Map::new(),
        }
    }

    pub fn with_owner_type(mut self, owner_type: OwnerType) -> Self {
        self.owner_type = owner_type;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled | RunStatus::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: String,
    pub state: RunStatus,
    pub progress: f64,
    pub completed_steps: usize,
    pub total_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<usize>,
    pub last_event_seq: u64,
    pub sandbox_id: String,
    pub lock_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
