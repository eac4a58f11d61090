use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use overseer_core::{
    elapsed_between, normalize_scope, sweep_interval, to_chrono, AsyncTracker,
    CancellationRegistry, EngineConfig, ErrorKind, EventRing, LockError, RetryPolicy,
    ScopeLockManager, SharedClock, TrackerConfig,
};
use overseer_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use overseer_types::{
    new_id, ApproveRequest, ApproveResult, AsyncOperationStatus, CreateSandboxRequest,
    DiffResult, LockRequest, PlanStep, RunEvent, RunEventKind, RunRequest, RunSnapshot,
    RunStatus, Sandbox, SandboxStatus, StepOutcome, StepReport, StepResult,
};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::traits::{
    EventSink, RunRepository, SandboxError, SandboxProvider, StepContext, StepExecutor,
};

const REVIEW_ACTOR_SYSTEM: &str = "system";
const MAX_JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Collaborators injected into the orchestrator.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub executor: Arc<dyn StepExecutor>,
    pub sandbox: Arc<dyn SandboxProvider>,
    pub sink: Arc<dyn EventSink>,
    pub repository: Arc<dyn RunRepository>,
    /// Shared tracker; a private one is built from the config when absent.
    pub tracker: Option<AsyncTracker>,
}

#[derive(Debug, Clone)]
struct RunState {
    status: RunStatus,
    completed_steps: usize,
    current_step: Option<usize>,
    terminal_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

struct RunHandle {
    request: RunRequest,
    lock_id: String,
    sandbox: Sandbox,
    ring: Arc<EventRing>,
    cancel: CancellationToken,
    ttl: Duration,
    started_at: DateTime<Utc>,
    state: Mutex<RunState>,
    terminal: watch::Sender<Option<RunStatus>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl RunHandle {
    fn id(&self) -> &str {
        &self.request.id
    }

    fn status(&self) -> RunStatus {
        self.state.lock().status
    }

    fn deadline(&self) -> DateTime<Utc> {
        self.started_at + to_chrono(self.ttl)
    }
}

#[derive(Debug, Clone)]
struct IdempotencyEntry {
    run_id: String,
    /// `None` while the run is live.
    expires_at: Option<DateTime<Utc>>,
}

/// What ended one attempt of a step.
enum Attempt {
    Finished(StepResult),
    Cancelled,
    TimedOut,
}

struct Inner {
    config: EngineConfig,
    clock: SharedClock,
    executor: Arc<dyn StepExecutor>,
    sandbox: Arc<dyn SandboxProvider>,
    sink: Arc<dyn EventSink>,
    repository: Arc<dyn RunRepository>,
    tracker: AsyncTracker,
    locks: Arc<ScopeLockManager>,
    cancellations: CancellationRegistry,
    retry: RetryPolicy,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
    idempotency: Mutex<HashMap<String, IdempotencyEntry>>,
    keyed_admission: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Admits runs under exclusive scope locks, provisions a sandbox per run,
/// drives the plan and finalizes exactly once.
#[derive(Clone)]
pub struct RunOrchestrator {
    inner: Arc<Inner>,
}

impl RunOrchestrator {
    pub fn new(config: EngineConfig, clock: SharedClock, deps: OrchestratorDeps) -> Self {
        let tracker = deps
            .tracker
            .unwrap_or_else(|| AsyncTracker::new(TrackerConfig::from(&config), clock.clone()));
        Self {
            inner: Arc::new(Inner {
                locks: Arc::new(ScopeLockManager::new(clock.clone())),
                config,
                clock,
                executor: deps.executor,
                sandbox: deps.sandbox,
                sink: deps.sink,
                repository: deps.repository,
                tracker,
                cancellations: CancellationRegistry::new(),
                retry: RetryPolicy::sandbox_default(),
                runs: RwLock::new(HashMap::new()),
                idempotency: Mutex::new(HashMap::new()),
                keyed_admission: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Overrides the sandbox-creation backoff schedule.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.retry = retry;
        }
        self
    }

    /// Spawns the lock sweeper, the tracker janitor and the run janitor.
    /// Calling it twice is a no-op.
    pub fn start(&self) {
        let mut background = self.inner.background.lock();
        if !background.is_empty() {
            return;
        }
        let sweep = sweep_interval(self.inner.config.default_run_ttl());
        background.push(
            self.inner
                .locks
                .spawn_sweeper(sweep, self.inner.shutdown.child_token()),
        );
        let janitor = (self.inner.config.async_retention_window() / 4).min(MAX_JANITOR_INTERVAL);
        background.push(
            self.inner
                .tracker
                .spawn_janitor(janitor, self.inner.shutdown.child_token()),
        );
        background.push(self.spawn_run_janitor(janitor));
        tracing::debug!(
            "orchestrator background tasks started (sweep every {:?}, janitor every {:?})",
            sweep,
            janitor
        );
    }

    /// Drops finished runs from memory once they have been terminal for the
    /// async retention window. Their events stay readable from the repository.
    fn spawn_run_janitor(&self, interval: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.shutdown.child_token();
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = inner.clock.timer(interval) => {
                        let evicted = inner.evict_finished();
                        if evicted > 0 {
                            tracing::debug!("evicted {} finished runs from memory", evicted);
                        }
                    }
                }
            }
        })
    }

    pub fn tracker(&self) -> &AsyncTracker {
        &self.inner.tracker
    }

    pub fn locks(&self) -> &ScopeLockManager {
        &self.inner.locks
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Admits a run and returns its id. The plan runs in the background.
    pub async fn submit(&self, request: RunRequest) -> OrchestratorResult<String> {
        let request = validate_request(request, &self.inner.config)?;
        let _keyed = match request.idempotency_key {
            Some(_) => Some(self.inner.keyed_admission.lock().await),
            None => None,
        };
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.inner.lookup_idempotent(key) {
                tracing::debug!("idempotency key {} resolved to run {}", key, existing);
                return Ok(existing);
            }
        }
        if self.inner.runs.read().contains_key(&request.id) {
            return Err(OrchestratorError::Duplicate(request.id));
        }
        self.inner.admit(request).await
    }

    pub fn status(&self, run_id: &str) -> OrchestratorResult<RunSnapshot> {
        let run = self.inner.run(run_id)?;
        let state = run.state.lock().clone();
        let total_steps = run.request.plan.steps.len();
        let progress = match (state.status, total_steps) {
            (RunStatus::Succeeded, _) => 1.0,
            (_, 0) => 0.0,
            _ => state.completed_steps as f64 / total_steps as f64,
        };
        Ok(RunSnapshot {
            run_id: run.id().to_string(),
            state: state.status,
            progress,
            completed_steps: state.completed_steps,
            total_steps,
            current_step: state.current_step,
            last_event_seq: run.ring.last_seq(),
            sandbox_id: run.sandbox.id.clone(),
            lock_id: run.lock_id.clone(),
            started_at: run.started_at,
            terminal_at: state.terminal_at,
            error: state.error,
        })
    }

    /// Signals the run. The driver moves it to `cancelled` once the
    /// in-flight step yields.
    pub fn cancel(&self, run_id: &str) -> OrchestratorResult<()> {
        let run = self.inner.run(run_id)?;
        if run.status().is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal(run_id.to_string()));
        }
        if let Err(err) = self.inner.tracker.cancel(run_id) {
            tracing::debug!("tracker cancel for run {}: {}", run_id, err);
        }
        run.cancel.cancel();
        tracing::info!("cancellation requested for run {}", run_id);
        Ok(())
    }

    /// Ordered events after `after_seq`. Live runs stream from their ring
    /// until finalized; runs no longer in memory replay from the repository.
    pub async fn events(
        &self,
        run_id: &str,
        after_seq: u64,
    ) -> OrchestratorResult<BoxStream<'static, RunEvent>> {
        if let Some(run) = self.inner.runs.read().get(run_id).cloned() {
            return Ok(run.ring.stream(after_seq).boxed());
        }
        if self.inner.repository.load_run(run_id).await?.is_none() {
            return Err(OrchestratorError::NotFound(run_id.to_string()));
        }
        let events = self
            .inner
            .repository
            .list_events(run_id, after_seq, usize::MAX)
            .await?;
        Ok(stream::iter(events).boxed())
    }

    /// Resolves with the terminal status once the run is finalized. Runs
    /// already evicted from memory answer from the repository.
    pub async fn wait_terminal(&self, run_id: &str) -> OrchestratorResult<RunStatus> {
        let resident = self.inner.runs.read().get(run_id).cloned();
        let Some(run) = resident else {
            return match self.inner.repository.load_run(run_id).await? {
                Some(stored) if stored.status.is_terminal() => Ok(stored.status),
                _ => Err(OrchestratorError::NotFound(run_id.to_string())),
            };
        };
        let mut rx = run.terminal.subscribe();
        let status = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| OrchestratorError::Internal(anyhow::anyhow!("run {} dropped", run_id)))?;
        (*status).ok_or_else(|| OrchestratorError::Internal(anyhow::anyhow!("run {} has no status", run_id)))
    }

    pub async fn diff(&self, run_id: &str) -> OrchestratorResult<DiffResult> {
        let run = self.inner.run(run_id)?;
        Ok(self.inner.sandbox.get_diff(&run.sandbox.id).await?)
    }

    pub async fn approve(
        &self,
        run_id: &str,
        actor: &str,
        commit_message: Option<String>,
    ) -> OrchestratorResult<ApproveResult> {
        let run = self.inner.reviewable_run(run_id)?;
        let request = ApproveRequest {
            sandbox_id: run.sandbox.id.clone(),
            actor: actor.to_string(),
            commit_message,
            file_ids: None,
        };
        self.inner.log_review(&run, "approve", actor, request.commit_message.as_deref());
        let result = self.inner.sandbox.approve(request).await?;
        self.inner.sync_sandbox_status(&run).await;
        Ok(result)
    }

    pub async fn partial_approve(
        &self,
        run_id: &str,
        actor: &str,
        file_ids: Vec<String>,
        commit_message: Option<String>,
    ) -> OrchestratorResult<ApproveResult> {
        if file_ids.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "partial approve needs at least one file id".to_string(),
            ));
        }
        let run = self.inner.reviewable_run(run_id)?;
        let request = ApproveRequest {
            sandbox_id: run.sandbox.id.clone(),
            actor: actor.to_string(),
            commit_message,
            file_ids: Some(file_ids),
        };
        self.inner
            .log_review(&run, "partial_approve", actor, request.commit_message.as_deref());
        let result = self.inner.sandbox.partial_approve(request).await?;
        self.inner.sync_sandbox_status(&run).await;
        Ok(result)
    }

    pub async fn reject(&self, run_id: &str, actor: &str) -> OrchestratorResult<()> {
        let run = self.inner.reviewable_run(run_id)?;
        self.inner.log_review(&run, "reject", actor, None);
        self.inner.sandbox.reject(&run.sandbox.id, actor).await?;
        self.inner.sync_sandbox_status(&run).await;
        Ok(())
    }

    /// Cancels every live run, waits for their finalizers and stops the
    /// background tasks.
    pub async fn shutdown(&self) {
        let live: Vec<Arc<RunHandle>> = self
            .inner
            .runs
            .read()
            .values()
            .filter(|run| !run.status().is_terminal())
            .cloned()
            .collect();
        let signalled = self.inner.cancellations.cancel_all();
        tracing::info!(
            "orchestrator shutting down ({} live runs, {} signalled)",
            live.len(),
            signalled
        );
        for run in live {
            let mut rx = run.terminal.subscribe();
            let _ = rx.wait_for(Option::is_some).await;
        }
        self.inner.shutdown.cancel();
        let background: Vec<JoinHandle<()>> = self.inner.background.lock().drain(..).collect();
        for handle in background {
            let _ = handle.await;
        }
    }
}

impl Inner {
    fn run(&self, run_id: &str) -> OrchestratorResult<Arc<RunHandle>> {
        self.runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(run_id.to_string()))
    }

    fn reviewable_run(&self, run_id: &str) -> OrchestratorResult<Arc<RunHandle>> {
        let run = self.run(run_id)?;
        if !run.status().is_terminal() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "run {} is still {}",
                run_id,
                run.status()
            )));
        }
        Ok(run)
    }

    /// Removes finalized runs whose retention has lapsed, plus expired
    /// idempotency entries.
    fn evict_finished(&self) -> usize {
        let now = self.clock.now();
        let retention = to_chrono(self.config.async_retention_window());
        let evicted = {
            let mut runs = self.runs.write();
            let before = runs.len();
            runs.retain(|_, run| {
                let finalized = run.terminal.borrow().is_some();
                match run.state.lock().terminal_at {
                    Some(at) if finalized => at + retention > now,
                    _ => true,
                }
            });
            before - runs.len()
        };
        self.idempotency
            .lock()
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        evicted
    }

    fn lookup_idempotent(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let mut entries = self.idempotency.lock();
        entries.retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        entries.get(key).map(|entry| entry.run_id.clone())
    }

    async fn admit(self: &Arc<Self>, mut request: RunRequest) -> OrchestratorResult<String> {
        let ttl = request
            .ttl_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.default_run_ttl());
        request.ttl_ms = Some(ttl.as_millis() as u64);

        let lock = match self.locks.acquire(&LockRequest {
            run_id: request.id.clone(),
            scope_path: request.scope_path.clone(),
            project_root: request.project_root.clone(),
            ttl_ms: ttl.as_millis() as u64,
        }) {
            Ok(lock) => lock,
            Err(LockError::Conflict(conflict)) => {
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        run_id: Some(&request.id),
                        scope: Some(&request.scope_path),
                        error_code: Some(ErrorKind::ScopeConflict.as_str()),
                        detail: Some(&conflict.holder_run_id),
                        ..ObservabilityEvent::new("run.scope_conflict", "orchestrator")
                    },
                );
                return Err(OrchestratorError::ScopeConflict(conflict));
            }
            Err(err) => return Err(err.into()),
        };

        let sandbox = match self.create_sandbox(&request).await {
            Ok(sandbox) => sandbox,
            Err(err) => {
                self.locks.release(&lock.id);
                let classification = if self.sandbox.is_available().await.available {
                    ErrorKind::System
                } else {
                    ErrorKind::MissingDependency
                };
                let message = err.to_string();
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        run_id: Some(&request.id),
                        scope: Some(&request.scope_path),
                        error_code: Some(classification.as_str()),
                        detail: Some(&message),
                        ..ObservabilityEvent::new("run.sandbox_unavailable", "orchestrator")
                    },
                );
                return Err(OrchestratorError::SandboxUnavailable {
                    classification,
                    message,
                });
            }
        };

        let run_id = request.id.clone();
        let started_at = self.clock.now();
        let chat_id = metadata_str(&request, "chatId").unwrap_or(&request.owner).to_string();
        let scenario = metadata_str(&request, "scenario").unwrap_or("plan").to_string();
        let operation = match self.tracker.start(&run_id, &chat_id, "run", &scenario, None) {
            Ok(op) => op,
            Err(err) => {
                tracing::warn!("run {} collides with a tracked operation: {}", run_id, err);
                self.locks.release(&lock.id);
                return Err(OrchestratorError::Duplicate(run_id));
            }
        };

        if let Err(err) = self.repository.create_run(&request, started_at).await {
            tracing::warn!("failed to persist run {}: {}", run_id, err);
        }
        if let Err(err) = self.repository.create_sandbox_record(&run_id, &sandbox).await {
            tracing::warn!("failed to persist sandbox {}: {}", sandbox.id, err);
        }
        if let Err(err) = self.repository.record_async_operation(&operation).await {
            tracing::warn!("failed to persist operation {}: {}", run_id, err);
        }

        let ring = Arc::new(EventRing::new(
            run_id.clone(),
            self.config.event_buffer_size,
            self.clock.clone(),
        ));
        let (terminal, _) = watch::channel(None);
        let run = Arc::new(RunHandle {
            cancel: self.cancellations.create(&run_id),
            lock_id: lock.id.clone(),
            sandbox,
            ring,
            ttl,
            started_at,
            state: Mutex::new(RunState {
                status: RunStatus::Pending,
                completed_steps: 0,
                current_step: None,
                terminal_at: None,
                error: None,
            }),
            terminal,
            forwarder: Mutex::new(None),
            request,
        });
        *run.forwarder.lock() = Some(self.spawn_forwarder(&run));

        self.runs.write().insert(run_id.clone(), Arc::clone(&run));
        if let Some(key) = &run.request.idempotency_key {
            self.idempotency.lock().insert(
                key.clone(),
                IdempotencyEntry {
                    run_id: run_id.clone(),
                    expires_at: None,
                },
            );
        }

        run.ring.append(
            RunEventKind::RunCreated,
            json!({
                "runId": run_id,
                "scopePath": run.request.scope_path,
                "projectRoot": run.request.project_root,
                "owner": run.request.owner,
                "ownerType": run.request.owner_type,
                "sandboxId": run.sandbox.id,
                "lockId": run.lock_id,
                "totalSteps": run.request.plan.steps.len(),
                "ttlMs": ttl.as_millis() as u64,
            }),
        );
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                run_id: Some(&run_id),
                tool_call_id: Some(&run_id),
                scope: Some(&run.request.scope_path),
                status: Some(RunStatus::Pending.as_str()),
                correlation_id: run.request.idempotency_key.as_deref(),
                ..ObservabilityEvent::new("run.admitted", "orchestrator")
            },
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.drive(run).await;
        });
        Ok(run_id)
    }

    async fn create_sandbox(&self, request: &RunRequest) -> Result<Sandbox, SandboxError> {
        let create = CreateSandboxRequest {
            run_id: request.id.clone(),
            scope_path: request.scope_path.clone(),
            project_root: request.project_root.clone(),
            owner: request.owner.clone(),
            idempotency_key: Some(format!("run:{}", request.id)),
            metadata: Value::Object(request.metadata.clone()),
        };
        let mut attempt = 1;
        loop {
            match self.sandbox.create(create.clone()).await {
                Ok(sandbox) => return Ok(sandbox),
                Err(err) if err.is_transient() => {
                    let Some(delay) = self.retry.delay_after(attempt) else {
                        return Err(err);
                    };
                    tracing::warn!(
                        "sandbox create for run {} failed (attempt {}): {}; retrying in {:?}",
                        request.id,
                        attempt,
                        err,
                        delay
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(err),
                        _ = self.clock.timer(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Copies ring events to the sink and repository off the step path.
    fn spawn_forwarder(&self, run: &Arc<RunHandle>) -> JoinHandle<()> {
        let events = run.ring.stream(0);
        let sink = Arc::clone(&self.sink);
        let repository = Arc::clone(&self.repository);
        tokio::spawn(async move {
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                if event.kind.is_control() {
                    tracing::warn!(
                        "event forwarder for run {} fell behind: {}",
                        event.run_id,
                        event.payload
                    );
                    continue;
                }
                if let Err(err) = sink.publish(&event).await {
                    tracing::warn!(
                        "event sink rejected {} #{} for run {}: {}",
                        event.kind,
                        event.sequence,
                        event.run_id,
                        err
                    );
                }
                if let Err(err) = repository.append_event(&event).await {
                    tracing::warn!(
                        "failed to persist {} #{} for run {}: {}",
                        event.kind,
                        event.sequence,
                        event.run_id,
                        err
                    );
                }
            }
        })
    }

    async fn drive(self: Arc<Self>, run: Arc<RunHandle>) {
        let mut deadline = self.clock.timer(run.ttl);
        let op_cancel = self.tracker.cancellation_token(run.id());

        run.state.lock().status = RunStatus::Running;
        if let Err(err) = self
            .repository
            .update_run_status(run.id(), RunStatus::Running, self.clock.now(), None)
            .await
        {
            tracing::warn!("failed to persist running status for {}: {}", run.id(), err);
        }
        run.ring
            .append(RunEventKind::RunStatus, json!({ "status": RunStatus::Running }));
        if let Err(err) = self
            .tracker
            .update(run.id(), Some(0.0), Some("running".to_string()), None)
        {
            tracing::debug!("tracker update for run {}: {}", run.id(), err);
        }

        let steps = &run.request.plan.steps;
        let max_attempts = run
            .request
            .plan
            .max_step_attempts
            .unwrap_or(self.config.max_step_attempts)
            .max(1);
        let mut terminal = RunStatus::Succeeded;
        let mut error = None;

        for (index, step) in steps.iter().enumerate() {
            if run.cancel.is_cancelled() || op_cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                terminal = RunStatus::Cancelled;
                break;
            }
            if self.clock.now() >= run.deadline() {
                terminal = RunStatus::TimedOut;
                error = Some(format!("run deadline of {:?} elapsed", run.ttl));
                break;
            }

            run.state.lock().current_step = Some(index);
            run.ring.append(
                RunEventKind::StepStarted,
                json!({
                    "stepIndex": index,
                    "nodeId": step.node_id,
                    "stepType": step.step_type,
                }),
            );

            let started_at = self.clock.now();
            let mut attempt = 1;
            let result = loop {
                let step_cancel = run.cancel.child_token();
                let ctx = StepContext {
                    run_id: run.id().to_string(),
                    step_index: index,
                    attempt,
                    sandbox_id: run.sandbox.id.clone(),
                    work_dir: run.sandbox.work_dir.clone(),
                    cancel: step_cancel.clone(),
                };
                let outcome = tokio::select! {
                    biased;
                    _ = run.cancel.cancelled() => Attempt::Cancelled,
                    _ = op_cancelled(op_cancel.clone()) => Attempt::Cancelled,
                    _ = &mut deadline => Attempt::TimedOut,
                    result = self.executor.execute(ctx, step) => Attempt::Finished(result),
                };
                step_cancel.cancel();

                match outcome {
                    Attempt::Finished(result)
                        if attempt < max_attempts && should_retry(step, &result.outcome) =>
                    {
                        run.ring.append(
                            RunEventKind::RunProgress,
                            json!({
                                "stepIndex": index,
                                "attempt": attempt,
                                "nextAttempt": attempt + 1,
                                "outcome": result.outcome,
                            }),
                        );
                        attempt += 1;
                    }
                    Attempt::Finished(result) => break result,
                    Attempt::Cancelled => break StepResult::cancelled(),
                    Attempt::TimedOut => {
                        break StepResult {
                            outcome: StepOutcome::TimedOut,
                            artifacts: Default::default(),
                        }
                    }
                }
            };

            let completed_at = self.clock.now();
            let report = StepReport {
                step_index: index,
                node_id: step.node_id.clone(),
                step_type: step.step_type.clone(),
                started_at,
                completed_at,
                duration_ms: elapsed_between(started_at, completed_at).as_millis() as u64,
                outcome: result.outcome,
                artifacts: result.artifacts,
            };
            let mut payload = serde_json::to_value(&report).unwrap_or_else(|_| json!({}));
            if let Value::Object(map) = &mut payload {
                map.insert("attempts".to_string(), json!(attempt));
            }
            let kind = if report.outcome.is_success() {
                RunEventKind::StepCompleted
            } else {
                RunEventKind::StepFailed
            };
            run.ring.append(kind, payload);

            match report.outcome {
                StepOutcome::Success => {
                    let completed = {
                        let mut state = run.state.lock();
                        state.completed_steps += 1;
                        state.completed_steps
                    };
                    if let Err(err) = self.tracker.update(
                        run.id(),
                        Some(completed as f64 / steps.len() as f64),
                        Some(format!("step {} completed", index)),
                        None,
                    ) {
                        tracing::debug!("tracker update for run {}: {}", run.id(), err);
                    }
                }
                StepOutcome::Failure {
                    classification,
                    cause,
                    ..
                } => {
                    terminal = RunStatus::Failed;
                    error = Some(format!("step {} failed ({}): {}", index, classification, cause));
                    break;
                }
                StepOutcome::Cancelled => {
                    terminal = RunStatus::Cancelled;
                    break;
                }
                StepOutcome::TimedOut => {
                    terminal = RunStatus::TimedOut;
                    error = Some(format!("step {} exceeded the run deadline", index));
                    break;
                }
            }
        }

        self.finalize(&run, terminal, error).await;
    }

    /// The only place a run acquires a terminal status.
    async fn finalize(&self, run: &Arc<RunHandle>, status: RunStatus, error: Option<String>) {
        let now = self.clock.now();
        let (completed_steps, total_steps) = {
            let mut state = run.state.lock();
            state.status = status;
            state.terminal_at = Some(now);
            state.current_step = None;
            state.error = error.clone();
            (state.completed_steps, run.request.plan.steps.len())
        };

        if let Err(err) = self
            .repository
            .update_run_status(run.id(), status, now, error.as_deref())
            .await
        {
            tracing::warn!("failed to persist terminal status for {}: {}", run.id(), err);
        }
        run.ring.append(
            RunEventKind::RunStatus,
            json!({ "status": status, "error": error }),
        );

        let result = json!({
            "completedSteps": completed_steps,
            "totalSteps": total_steps,
            "sandboxId": run.sandbox.id,
        });
        let op_status = AsyncOperationStatus::from(status);
        match self
            .tracker
            .complete(run.id(), op_status, Some(result.clone()), error.clone())
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!("async operation {} was already terminal", run.id()),
            Err(err) => tracing::warn!("tracker completion for {} failed: {}", run.id(), err),
        }
        if let Err(err) = self
            .repository
            .mark_operation_terminal(run.id(), op_status, Some(&result), error.as_deref())
            .await
        {
            tracing::warn!("failed to persist operation {}: {}", run.id(), err);
        }

        let duration_ms = elapsed_between(run.started_at, now).as_millis() as u64;
        if status == RunStatus::Succeeded {
            run.ring.append(
                RunEventKind::ExecutionCompleted,
                json!({
                    "status": status,
                    "completedSteps": completed_steps,
                    "totalSteps": total_steps,
                    "durationMs": duration_ms,
                }),
            );
        } else {
            run.ring.append(
                RunEventKind::ExecutionFailed,
                json!({
                    "status": status,
                    "error": error,
                    "classification": terminal_kind(status).as_str(),
                    "completedSteps": completed_steps,
                    "totalSteps": total_steps,
                    "durationMs": duration_ms,
                }),
            );
        }

        if !self.locks.release(&run.lock_id) {
            tracing::debug!("scope lock {} had already expired", run.lock_id);
        }
        if let Some(key) = &run.request.idempotency_key {
            if let Some(entry) = self.idempotency.lock().get_mut(key) {
                if entry.run_id == run.id() {
                    entry.expires_at = Some(now + to_chrono(run.ttl));
                }
            }
        }

        if status != RunStatus::Succeeded && self.config.auto_reject_on_failure {
            match self
                .sandbox
                .reject(&run.sandbox.id, REVIEW_ACTOR_SYSTEM)
                .await
            {
                Ok(()) => self.sync_sandbox_status(run).await,
                Err(err) => tracing::warn!(
                    "auto-reject of sandbox {} failed: {}",
                    run.sandbox.id,
                    err
                ),
            }
        }

        run.ring.close();
        let forwarder = run.forwarder.lock().take();
        if let Some(mut forwarder) = forwarder {
            tokio::select! {
                _ = &mut forwarder => {}
                _ = self.clock.timer(self.config.slow_subscriber_timeout()) => {
                    forwarder.abort();
                    tracing::warn!(
                        "event forwarder for run {} did not drain in time; undelivered events dropped",
                        run.id()
                    );
                }
            }
        }
        if let Some(token) = self.cancellations.remove(run.id()) {
            token.cancel();
        }
        run.terminal.send_replace(Some(status));

        emit_event(
            if status == RunStatus::Succeeded {
                Level::INFO
            } else {
                Level::WARN
            },
            ProcessKind::Engine,
            ObservabilityEvent {
                run_id: Some(run.id()),
                tool_call_id: Some(run.id()),
                scope: Some(&run.request.scope_path),
                status: Some(status.as_str()),
                error_code: (status != RunStatus::Succeeded).then(|| terminal_kind(status).as_str()),
                detail: error.as_deref(),
                ..ObservabilityEvent::new("run.finalized", "orchestrator")
            },
        );
    }

    async fn sync_sandbox_status(&self, run: &RunHandle) {
        let status = match self.sandbox.get(&run.sandbox.id).await {
            Ok(sandbox) => sandbox.status,
            Err(err) => {
                tracing::warn!("could not read sandbox {}: {}", run.sandbox.id, err);
                return;
            }
        };
        if let Err(err) = self
            .repository
            .update_sandbox_status(&run.sandbox.id, status)
            .await
        {
            tracing::warn!("failed to persist sandbox {} as {}: {}", run.sandbox.id, status, err);
        }
        if matches!(status, SandboxStatus::Approved | SandboxStatus::Rejected) {
            tracing::info!("sandbox {} for run {} is now {}", run.sandbox.id, run.id(), status);
        }
    }

    fn log_review(&self, run: &RunHandle, action: &str, actor: &str, message: Option<&str>) {
        tracing::info!(
            run_id = run.id(),
            sandbox_id = %run.sandbox.id,
            actor = actor,
            commit_message = %message.map(redact_text).unwrap_or_default(),
            "sandbox review: {}",
            action
        );
    }
}

/// Normalizes paths and rejects requests that can never run.
fn validate_request(mut request: RunRequest, config: &EngineConfig) -> OrchestratorResult<RunRequest> {
    if request.plan.instructions.trim().is_empty() {
        return Err(OrchestratorError::InvalidRequest(
            "plan instructions are empty".to_string(),
        ));
    }
    if request.owner.trim().is_empty() {
        return Err(OrchestratorError::InvalidRequest("owner is empty".to_string()));
    }
    if request.ttl_ms == Some(0) {
        return Err(OrchestratorError::InvalidRequest(
            "ttl must be greater than zero".to_string(),
        ));
    }
    if request.plan.max_step_attempts == Some(0) {
        return Err(OrchestratorError::InvalidRequest(
            "maxStepAttempts must be at least 1".to_string(),
        ));
    }
    if request
        .idempotency_key
        .as_deref()
        .is_some_and(|key| key.trim().is_empty())
    {
        request.idempotency_key = None;
    }
    request.scope_path = normalize_scope(&request.scope_path)?;
    request.project_root = normalize_scope(&request.project_root)?;
    if request.id.trim().is_empty() {
        request.id = new_id("run");
    }
    if request.ttl_ms.is_none() {
        request.ttl_ms = Some(config.default_run_ttl_ms);
    }
    Ok(request)
}

fn metadata_str<'a>(request: &'a RunRequest, key: &str) -> Option<&'a str> {
    request.metadata.get(key).and_then(Value::as_str)
}

/// A failed attempt is retried when the executor says so or the step opts in.
fn should_retry(step: &PlanStep, outcome: &StepOutcome) -> bool {
    match outcome {
        StepOutcome::Failure { retryable, .. } => *retryable || step.retryable,
        _ => false,
    }
}

fn terminal_kind(status: RunStatus) -> ErrorKind {
    match status {
        RunStatus::Cancelled => ErrorKind::Cancelled,
        RunStatus::TimedOut => ErrorKind::TimedOut,
        _ => ErrorKind::System,
    }
}

async fn op_cancelled(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(scope: &str) -> RunRequest {
        RunRequest::new(
            scope,
            "/proj/",
            "alice",
            overseer_types::Plan::new("tidy up", vec![PlanStep::new("n1", "noop")]),
        )
    }

    #[test]
    fn validation_normalizes_paths_and_fills_defaults() {
        let config = EngineConfig::default();
        let mut raw = request("src/./pkg/");
        raw.id = String::new();
        raw.idempotency_key = Some("  ".to_string());
        let validated = validate_request(raw, &config).expect("valid");
        assert_eq!(validated.scope_path, "/src/pkg");
        assert_eq!(validated.project_root, "/proj");
        assert!(validated.id.starts_with("run_"));
        assert_eq!(validated.ttl_ms, Some(config.default_run_ttl_ms));
        assert!(validated.idempotency_key.is_none());
    }

    #[test]
    fn validation_rejects_unrunnable_requests() {
        let config = EngineConfig::default();
        let mut empty_plan = request("/src");
        empty_plan.plan.instructions = "   ".to_string();
        assert!(matches!(
            validate_request(empty_plan, &config),
            Err(OrchestratorError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_request(request(""), &config),
            Err(OrchestratorError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_request(request("/src").with_ttl_ms(0), &config),
            Err(OrchestratorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn only_failures_are_retried() {
        let plain = PlanStep::new("n", "click");
        let opted_in = PlanStep::new("n", "click").retryable();
        let soft = StepOutcome::failure(false, "system", "flaky");
        assert!(!should_retry(&plain, &soft));
        assert!(should_retry(&opted_in, &soft));
        assert!(should_retry(&plain, &StepOutcome::failure(true, "system", "reset")));
        assert!(!should_retry(&opted_in, &StepOutcome::Cancelled));
    }
}
