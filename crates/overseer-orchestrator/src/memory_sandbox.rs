use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use overseer_core::SharedClock;
use overseer_types::{
    new_id, ApproveRequest, ApproveResult, Availability, ChangeType, CreateSandboxRequest,
    DiffResult, FileChange, Sandbox, SandboxStatus,
};

use crate::traits::{SandboxError, SandboxProvider};

#[derive(Debug, Clone)]
struct StagedFile {
    change: FileChange,
    /// Canonical content when the change was staged; `None` if the file did not exist.
    base: Option<String>,
    content: Option<String>,
}

struct SandboxEntry {
    sandbox: Sandbox,
    staged: BTreeMap<String, StagedFile>,
}

#[derive(Default)]
struct ProviderState {
    sandboxes: HashMap<String, SandboxEntry>,
    by_idempotency_key: HashMap<String, String>,
    canonical: BTreeMap<(String, String), String>,
    available: Option<String>,
    create_failures: VecDeque<SandboxError>,
    create_calls: usize,
}

/// Sandbox provider backed by process memory. Each sandbox stages file
/// changes against a shared canonical store keyed by `(projectRoot, path)`.
pub struct InMemorySandboxProvider {
    clock: SharedClock,
    state: Mutex<ProviderState>,
}

impl InMemorySandboxProvider {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            state: Mutex::new(ProviderState::default()),
        }
    }

    /// Marks the backend as missing; `create` then fails with `Unavailable`.
    pub fn set_unavailable(&self, reason: impl Into<String>) {
        self.state.lock().available = Some(reason.into());
    }

    pub fn set_available(&self) {
        self.state.lock().available = None;
    }

    /// Queues an error returned by the next `create` call.
    pub fn fail_next_create(&self, error: SandboxError) {
        self.state.lock().create_failures.push_back(error);
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    pub fn write_canonical(&self, project_root: &str, path: &str, content: impl Into<String>) {
        self.state
            .lock()
            .canonical
            .insert((project_root.to_string(), path.to_string()), content.into());
    }

    pub fn canonical_file(&self, project_root: &str, path: &str) -> Option<String> {
        self.state
            .lock()
            .canonical
            .get(&(project_root.to_string(), path.to_string()))
            .cloned()
    }

    /// Stages a write (`Some`) or delete (`None`) of `path` inside the sandbox.
    pub fn stage_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: Option<String>,
    ) -> Result<FileChange, SandboxError> {
        let mut state = self.state.lock();
        let root = state
            .sandboxes
            .get(sandbox_id)
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))?
            .sandbox
            .project_root
            .clone();
        let base = state.canonical.get(&(root, path.to_string())).cloned();
        let entry = state
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))?;
        if entry.sandbox.status != SandboxStatus::Active {
            return Err(SandboxError::InvalidTransition {
                id: sandbox_id.to_string(),
                from: entry.sandbox.status,
                to: SandboxStatus::Active,
            });
        }

        let change_type = match (&base, &content) {
            (_, None) => ChangeType::Deleted,
            (Some(_), Some(_)) => ChangeType::Modified,
            (None, Some(_)) => ChangeType::Added,
        };
        let existing_id = entry
            .staged
            .values()
            .find(|staged| staged.change.path == path)
            .map(|staged| staged.change.file_id.clone());
        let change = FileChange {
            file_id: existing_id.unwrap_or_else(|| new_id("file")),
            path: path.to_string(),
            change_type,
            additions: line_count(content.as_deref()),
            deletions: line_count(base.as_deref()),
        };
        entry.staged.insert(
            change.file_id.clone(),
            StagedFile {
                change: change.clone(),
                base,
                content,
            },
        );
        Ok(change)
    }

    fn apply(&self, request: ApproveRequest, partial: bool) -> Result<ApproveResult, SandboxError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let ProviderState {
            sandboxes,
            canonical,
            ..
        } = &mut *state;
        let entry = sandboxes
            .get_mut(&request.sandbox_id)
            .ok_or_else(|| SandboxError::NotFound(request.sandbox_id.clone()))?;
        ensure_reviewable(entry, SandboxStatus::Approved)?;

        let selected: Vec<String> = match &request.file_ids {
            Some(ids) => ids.clone(),
            None => entry.staged.keys().cloned().collect(),
        };
        for file_id in &selected {
            let Some(staged) = entry.staged.get(file_id) else {
                return Err(SandboxError::ApplyFailed(format!(
                    "unknown file id {}",
                    file_id
                )));
            };
            let key = (entry.sandbox.project_root.clone(), staged.change.path.clone());
            if canonical.get(&key) != staged.base.as_ref() {
                return Err(SandboxError::ApplyFailed(format!(
                    "{} changed since it was staged",
                    staged.change.path
                )));
            }
        }

        let mut applied_files = Vec::with_capacity(selected.len());
        for file_id in &selected {
            if let Some(staged) = entry.staged.remove(file_id) {
                let key = (entry.sandbox.project_root.clone(), staged.change.path.clone());
                match staged.content {
                    Some(content) => {
                        canonical.insert(key, content);
                    }
                    None => {
                        canonical.remove(&key);
                    }
                }
                applied_files.push(staged.change.path);
            }
        }

        let remaining = entry.staged.len();
        if entry.sandbox.status == SandboxStatus::Stopped {
            entry.sandbox.status = SandboxStatus::Active;
        }
        if remaining == 0 || !partial {
            entry.sandbox.status = SandboxStatus::Approved;
        }
        tracing::debug!(
            "sandbox {} approved {} files by {} ({} remaining)",
            request.sandbox_id,
            applied_files.len(),
            request.actor,
            remaining
        );
        Ok(ApproveResult {
            success: true,
            applied: applied_files.len(),
            remaining,
            is_partial: remaining > 0,
            commit_hash: (!applied_files.is_empty())
                .then(|| uuid::Uuid::new_v4().simple().to_string()[..12].to_string()),
            applied_at: now,
            applied_files,
        })
    }

    fn transition(&self, sandbox_id: &str, to: SandboxStatus) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        let entry = state
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))?;
        let from = entry.sandbox.status;
        if !from.can_transition_to(to) {
            return Err(SandboxError::InvalidTransition {
                id: sandbox_id.to_string(),
                from,
                to,
            });
        }
        entry.sandbox.status = to;
        Ok(())
    }
}

/// Approve and reject are accepted from `active` or `stopped`; a stopped
/// sandbox passes through `active` on the way.
fn ensure_reviewable(entry: &SandboxEntry, to: SandboxStatus) -> Result<(), SandboxError> {
    let from = entry.sandbox.status;
    if from.is_reviewable() {
        return Ok(());
    }
    Err(SandboxError::InvalidTransition {
        id: entry.sandbox.id.clone(),
        from,
        to,
    })
}

fn line_count(content: Option<&str>) -> u32 {
    content.map_or(0, |text| text.lines().count() as u32)
}

#[async_trait]
impl SandboxProvider for InMemorySandboxProvider {
    async fn create(&self, request: CreateSandboxRequest) -> Result<Sandbox, SandboxError> {
        let mut state = self.state.lock();
        state.create_calls += 1;
        if let Some(error) = state.create_failures.pop_front() {
            return Err(error);
        }
        if let Some(reason) = &state.available {
            return Err(SandboxError::Unavailable(reason.clone()));
        }
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = state
                .by_idempotency_key
                .get(key)
                .and_then(|id| state.sandboxes.get(id))
            {
                return Ok(existing.sandbox.clone());
            }
        }

        let id = new_id("sbx");
        let mut sandbox = Sandbox {
            work_dir: format!(
                "{}/.overseer/sandboxes/{}",
                request.project_root.trim_end_matches('/'),
                id
            ),
            id: id.clone(),
            scope_path: request.scope_path,
            project_root: request.project_root,
            status: SandboxStatus::Creating,
            created_at: self.clock.now(),
            metadata: json!({
                "runId": request.run_id,
                "owner": request.owner,
                "extra": request.metadata,
            }),
        };
        sandbox.status = SandboxStatus::Active;
        if let Some(key) = request.idempotency_key {
            state.by_idempotency_key.insert(key, id.clone());
        }
        state.sandboxes.insert(
            id,
            SandboxEntry {
                sandbox: sandbox.clone(),
                staged: BTreeMap::new(),
            },
        );
        Ok(sandbox)
    }

    async fn get(&self, sandbox_id: &str) -> Result<Sandbox, SandboxError> {
        self.state
            .lock()
            .sandboxes
            .get(sandbox_id)
            .map(|entry| entry.sandbox.clone())
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))
    }

    /// Deleted sandboxes stay queryable with status `deleted`.
    async fn delete(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.transition(sandbox_id, SandboxStatus::Deleted)?;
        if let Some(entry) = self.state.lock().sandboxes.get_mut(sandbox_id) {
            entry.staged.clear();
        }
        Ok(())
    }

    async fn workspace_path(&self, sandbox_id: &str) -> Result<String, SandboxError> {
        self.get(sandbox_id).await.map(|sandbox| sandbox.work_dir)
    }

    async fn get_diff(&self, sandbox_id: &str) -> Result<DiffResult, SandboxError> {
        let state = self.state.lock();
        let entry = state
            .sandboxes
            .get(sandbox_id)
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))?;
        let files: Vec<FileChange> = entry
            .staged
            .values()
            .map(|staged| staged.change.clone())
            .collect();
        Ok(DiffResult {
            sandbox_id: sandbox_id.to_string(),
            total_additions: files.iter().map(|f| f.additions).sum(),
            total_deletions: files.iter().map(|f| f.deletions).sum(),
            files,
        })
    }

    async fn approve(&self, mut request: ApproveRequest) -> Result<ApproveResult, SandboxError> {
        request.file_ids = None;
        self.apply(request, false)
    }

    async fn partial_approve(
        &self,
        request: ApproveRequest,
    ) -> Result<ApproveResult, SandboxError> {
        self.apply(request, true)
    }

    async fn reject(&self, sandbox_id: &str, actor: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        let entry = state
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))?;
        ensure_reviewable(entry, SandboxStatus::Rejected)?;
        let discarded = entry.staged.len();
        entry.staged.clear();
        entry.sandbox.status = SandboxStatus::Rejected;
        tracing::debug!(
            "sandbox {} rejected by {} ({} staged files discarded)",
            sandbox_id,
            actor,
            discarded
        );
        Ok(())
    }

    async fn stop(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.transition(sandbox_id, SandboxStatus::Stopped)
    }

    async fn start(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.transition(sandbox_id, SandboxStatus::Active)
    }

    async fn is_available(&self) -> Availability {
        match &self.state.lock().available {
            None => Availability::ok(),
            Some(reason) => Availability::missing(reason.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::ManualClock;
    use std::sync::Arc;

    fn provider() -> InMemorySandboxProvider {
        InMemorySandboxProvider::new(Arc::new(ManualClock::default()))
    }

    fn create_request(key: Option<&str>) -> CreateSandboxRequest {
        CreateSandboxRequest {
            run_id: "run_1".to_string(),
            scope_path: "/src".to_string(),
            project_root: "/proj".to_string(),
            owner: "alice".to_string(),
            idempotency_key: key.map(str::to_string),
            metadata: serde_json::Value::Null,
        }
    }

    fn approve_request(sandbox_id: &str, file_ids: Option<Vec<String>>) -> ApproveRequest {
        ApproveRequest {
            sandbox_id: sandbox_id.to_string(),
            actor: "alice".to_string(),
            commit_message: None,
            file_ids,
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_per_key() {
        let provider = provider();
        let a = provider.create(create_request(Some("k1"))).await.expect("a");
        let b = provider.create(create_request(Some("k1"))).await.expect("b");
        let c = provider.create(create_request(None)).await.expect("c");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.status, SandboxStatus::Active);
        assert!(a.work_dir.starts_with("/proj/.overseer/sandboxes/"));
    }

    #[tokio::test]
    async fn approve_applies_everything_staged() {
        let provider = provider();
        provider.write_canonical("/proj", "src/lib.rs", "old\n");
        let sandbox = provider.create(create_request(None)).await.expect("create");
        provider
            .stage_file(&sandbox.id, "src/lib.rs", Some("new\nlines\n".into()))
            .expect("stage");
        provider
            .stage_file(&sandbox.id, "src/new.rs", Some("fresh\n".into()))
            .expect("stage");

        let diff = provider.get_diff(&sandbox.id).await.expect("diff");
        assert_eq!(diff.files.len(), 2);
        assert_eq!(diff.total_additions, 3);
        assert_eq!(diff.total_deletions, 1);

        let result = provider
            .approve(approve_request(&sandbox.id, None))
            .await
            .expect("approve");
        assert!(result.success);
        assert_eq!(result.applied, 2);
        assert!(!result.is_partial);
        assert!(result.commit_hash.is_some());
        assert_eq!(
            provider.canonical_file("/proj", "src/lib.rs").as_deref(),
            Some("new\nlines\n")
        );
        assert_eq!(
            provider.get(&sandbox.id).await.expect("get").status,
            SandboxStatus::Approved
        );
    }

    #[tokio::test]
    async fn partial_approve_is_all_or_nothing() {
        let provider = provider();
        provider.write_canonical("/proj", "a.txt", "a0");
        let sandbox = provider.create(create_request(None)).await.expect("create");
        let a = provider
            .stage_file(&sandbox.id, "a.txt", Some("a1".into()))
            .expect("a");
        let b = provider
            .stage_file(&sandbox.id, "b.txt", Some("b1".into()))
            .expect("b");
        let c = provider.stage_file(&sandbox.id, "c.txt", None).expect("c");

        provider.write_canonical("/proj", "a.txt", "external edit");
        let err = provider
            .partial_approve(approve_request(
                &sandbox.id,
                Some(vec![a.file_id.clone(), b.file_id.clone()]),
            ))
            .await
            .expect_err("stale base must fail");
        assert!(matches!(err, SandboxError::ApplyFailed(_)));
        assert!(provider.canonical_file("/proj", "b.txt").is_none());

        let result = provider
            .partial_approve(approve_request(&sandbox.id, Some(vec![b.file_id.clone()])))
            .await
            .expect("partial");
        assert_eq!(result.applied, 1);
        assert_eq!(result.remaining, 2);
        assert!(result.is_partial);
        assert_eq!(provider.canonical_file("/proj", "b.txt").as_deref(), Some("b1"));
        assert_eq!(
            provider.get(&sandbox.id).await.expect("get").status,
            SandboxStatus::Active
        );
        let _ = c;
    }

    #[tokio::test]
    async fn reject_leaves_canonical_untouched() {
        let provider = provider();
        provider.write_canonical("/proj", "a.txt", "a0");
        let sandbox = provider.create(create_request(None)).await.expect("create");
        provider
            .stage_file(&sandbox.id, "a.txt", Some("a1".into()))
            .expect("stage");
        provider.stop(&sandbox.id).await.expect("stop");
        provider.reject(&sandbox.id, "bob").await.expect("reject");
        assert_eq!(provider.canonical_file("/proj", "a.txt").as_deref(), Some("a0"));
        assert_eq!(
            provider.get(&sandbox.id).await.expect("get").status,
            SandboxStatus::Rejected
        );
        assert!(provider
            .approve(approve_request(&sandbox.id, None))
            .await
            .is_err());
        provider.delete(&sandbox.id).await.expect("delete");
        assert_eq!(
            provider.get(&sandbox.id).await.expect("retained").status,
            SandboxStatus::Deleted
        );
    }

    #[tokio::test]
    async fn lifecycle_edges_are_enforced() {
        let provider = provider();
        let sandbox = provider.create(create_request(None)).await.expect("create");
        assert!(matches!(
            provider.delete(&sandbox.id).await,
            Err(SandboxError::InvalidTransition { .. })
        ));
        provider.stop(&sandbox.id).await.expect("stop");
        provider.start(&sandbox.id).await.expect("start");
        provider.stop(&sandbox.id).await.expect("stop again");
        provider.delete(&sandbox.id).await.expect("delete from stopped");
        assert!(provider.start(&sandbox.id).await.is_err());
    }

    #[tokio::test]
    async fn availability_and_injected_failures() {
        let provider = provider();
        provider.fail_next_create(SandboxError::Transport("reset".into()));
        assert!(provider
            .create(create_request(None))
            .await
            .is_err_and(|e| e.is_transient()));
        provider.set_unavailable("docker not installed");
        assert!(!provider.is_available().await.available);
        assert!(matches!(
            provider.create(create_request(None)).await,
            Err(SandboxError::Unavailable(_))
        ));
        assert_eq!(provider.create_calls(), 2);
    }
}
