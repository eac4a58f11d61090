use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use overseer_types::{AsyncOperation, AsyncOperationStatus, RunEvent, RunRequest, RunStatus, Sandbox, SandboxStatus};

use crate::traits::{RunRepository, StoredRun};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSandbox {
    pub id: String,
    pub run_id: String,
    pub status: SandboxStatus,
    pub work_dir: String,
    pub metadata: Value,
}

#[derive(Default)]
struct Tables {
    runs: HashMap<String, StoredRun>,
    events: HashMap<String, BTreeMap<u64, RunEvent>>,
    sandboxes: HashMap<String, StoredSandbox>,
    operations: HashMap<String, AsyncOperation>,
}

/// Process-local [`RunRepository`]. Event rows are unique per `(runId, sequence)`.
#[derive(Default)]
pub struct MemoryRunRepository {
    tables: Mutex<Tables>,
}

impl MemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sandbox(&self, sandbox_id: &str) -> Option<StoredSandbox> {
        self.tables.lock().sandboxes.get(sandbox_id).cloned()
    }

    pub fn operation(&self, tool_call_id: &str) -> Option<AsyncOperation> {
        self.tables.lock().operations.get(tool_call_id).cloned()
    }

    pub fn event_count(&self, run_id: &str) -> usize {
        self.tables
            .lock()
            .events
            .get(run_id)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl RunRepository for MemoryRunRepository {
    async fn create_run(&self, request: &RunRequest, started_at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut tables = self.tables.lock();
        if tables.runs.contains_key(&request.id) {
            bail!("run {} already stored", request.id);
        }
        let preset_used = request
            .metadata
            .get("preset")
            .and_then(Value::as_str)
            .map(str::to_string);
        tables.runs.insert(
            request.id.clone(),
            StoredRun {
                id: request.id.clone(),
                scope_path: request.scope_path.clone(),
                project_root: request.project_root.clone(),
                owner: request.owner.clone(),
                status: RunStatus::Pending,
                started_at,
                terminal_at: None,
                error: None,
                preset_used,
            },
        );
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut tables = self.tables.lock();
        let run = tables
            .runs
            .get_mut(run_id)
            .ok_or_else(|| anyhow!("run {} not stored", run_id))?;
        run.status = status;
        if status.is_terminal() {
            run.terminal_at = Some(at);
        }
        if let Some(error) = error {
            run.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn append_event(&self, event: &RunEvent) -> anyhow::Result<()> {
        let mut tables = self.tables.lock();
        let rows = tables.events.entry(event.run_id.clone()).or_default();
        if rows.contains_key(&event.sequence) {
            bail!(
                "event {} for run {} already stored",
                event.sequence,
                event.run_id
            );
        }
        rows.insert(event.sequence, event.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> anyhow::Result<Option<StoredRun>> {
        Ok(self.tables.lock().runs.get(run_id).cloned())
    }

    async fn list_events(
        &self,
        run_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<RunEvent>> {
        let tables = self.tables.lock();
        let Some(rows) = tables.events.get(run_id) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .range(after_seq.saturating_add(1)..)
            .take(limit)
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn create_sandbox_record(&self, run_id: &str, sandbox: &Sandbox) -> anyhow::Result<()> {
        self.tables.lock().sandboxes.insert(
            sandbox.id.clone(),
            StoredSandbox {
                id: sandbox.id.clone(),
                run_id: run_id.to_string(),
                status: sandbox.status,
                work_dir: sandbox.work_dir.clone(),
                metadata: sandbox.metadata.clone(),
            },
        );
        Ok(())
    }

    async fn update_sandbox_status(
        &self,
        sandbox_id: &str,
        status: SandboxStatus,
    ) -> anyhow::Result<()> {
        let mut tables = self.tables.lock();
        let record = tables
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| anyhow!("sandbox {} not stored", sandbox_id))?;
        record.status = status;
        Ok(())
    }

    async fn record_async_operation(&self, op: &AsyncOperation) -> anyhow::Result<()> {
        self.tables
            .lock()
            .operations
            .insert(op.tool_call_id.clone(), op.clone());
        Ok(())
    }

    async fn mark_operation_terminal(
        &self,
        tool_call_id: &str,
        status: AsyncOperationStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut tables = self.tables.lock();
        let op = tables
            .operations
            .get_mut(tool_call_id)
            .ok_or_else(|| anyhow!("operation {} not stored", tool_call_id))?;
        if op.is_terminal() {
            return Ok(());
        }
        op.status = status;
        op.result = result.cloned();
        op.error = error.map(str::to_string);
        Ok(())
    }
}
