use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPoint {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_ms: Option<u64>,
}

/// Side-effect descriptors a step may report. Screenshots are referenced by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepArtifacts {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cursor_trail: Vec<CursorPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_position: Option<CursorPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focused_element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StepOutcome {
    Success,
    Failure {
        retryable: bool,
        classification: String,
        cause: String,
    },
    Cancelled,
    TimedOut,
}

impl StepOutcome {
    pub fn failure(
        retryable: bool,
        classification: impl Into<String>,
        cause: impl Into<String>,
    ) -> Self {
        StepOutcome::Failure {
            retryable,
            classification: classification.into(),
            cause: cause.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepOutcome::Failure { retryable: true, .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub step_index: usize,
    pub node_id: String,
    pub step_type: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: StepOutcome,
    #[serde(default)]
    pub artifacts: StepArtifacts,
}

/// What an executor reports for one attempt; the orchestrator stamps timing and identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub outcome: StepOutcome,
    #[serde(default)]
    pub artifacts: StepArtifacts,
}

impl StepResult {
    pub fn success() -> Self {
        Self {
            outcome: StepOutcome::Success,
            artifacts: StepArtifacts::default(),
        }
    }

    pub fn failure(
        retryable: bool,
        classification: impl Into<String>,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            outcome: StepOutcome::failure(retryable, classification, cause),
            artifacts: StepArtifacts::default(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            outcome: StepOutcome::Cancelled,
            artifacts: StepArtifacts::default(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: StepArtifacts) -> Self {
        self.artifacts = artifacts;
        self
    }
}
