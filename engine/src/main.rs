use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

use overseer_core::{
    BreakerConfig, BreakerError, BreakerRegistry, ConfigStore, EngineConfig,
    FrameCollectorConfig, FrameCollectorRegistry, SystemClock,
};
use overseer_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent,
    ProcessKind,
};
use overseer_orchestrator::{
    InMemorySandboxProvider, MemoryRunRepository, NoopEventSink, OrchestratorDeps,
    RunOrchestrator, StepContext, StepExecutor,
};
use overseer_types::{FrameTimings, Plan, PlanStep, RunRequest, RunStatus, StepArtifacts, StepResult};

const LOG_RETENTION_DAYS: u64 = 14;
const FRAME_STATS_BREAKER: &str = "frame-stats";

#[derive(Parser, Debug)]
#[command(name = "overseer-engine")]
#[command(about = "Scope-locked run orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct ConfigArgs {
    /// Project config file; defaults to `<state-dir>/config.json`.
    #[arg(long)]
    config: Option<String>,
    #[arg(long, env = "OVERSEER_STATE_DIR")]
    state_dir: Option<String>,
    #[arg(long)]
    ttl_ms: Option<u64>,
    #[arg(long)]
    max_step_attempts: Option<u32>,
    #[arg(long, default_value_t = false)]
    auto_reject: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration.
    Config {
        #[command(flatten)]
        config: ConfigArgs,
        /// Print every layer instead of the merged result.
        #[arg(long, default_value_t = false)]
        layers: bool,
    },
    /// Run a plan against an in-memory sandbox and stream its events as JSON lines.
    DryRun {
        /// Plan JSON, `@path` to read a file, or `-` for stdin.
        #[arg(long)]
        plan: String,
        #[arg(long, default_value = "/")]
        scope: String,
        #[arg(long)]
        project_root: Option<String>,
        #[arg(long, env = "USER", default_value = "cli")]
        owner: String,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Aggregate frame timings (JSON array or JSON lines) per session.
    Frames {
        /// Frame JSON, `@path` to read a file, or `-` for stdin.
        #[arg(long)]
        input: String,
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Config { config, layers } => {
            let store = open_config(&config).await?;
            let value = if layers {
                let mut value = store.get_layers_value().await;
                if let Value::Object(map) = &mut value {
                    map.insert(
                        "paths".to_string(),
                        serde_json::json!({
                            "project": store.project_path().display().to_string(),
                            "global": store.global_path().display().to_string(),
                        }),
                    );
                }
                value
            } else {
                serde_json::to_value(store.get().await)?
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::DryRun {
            plan,
            scope,
            project_root,
            owner,
            config,
        } => {
            let _log_guard = init_logging(&config)?;
            let engine_config = load_engine_config(&config).await?;
            let plan = parse_plan(read_json_input(&plan)?)?;
            let project_root = match project_root {
                Some(root) => root,
                None => std::env::current_dir()?.display().to_string(),
            };
            let status = dry_run(engine_config, RunRequest::new(scope, project_root, owner, plan))
                .await?;
            if status != RunStatus::Succeeded {
                anyhow::bail!("run finished as {}", status);
            }
        }
        Command::Frames { input, config } => {
            let _log_guard = init_logging(&config)?;
            let engine_config = load_engine_config(&config).await?;
            let frames = parse_frames(&read_input(&input)?)?;
            aggregate_frames(&engine_config, frames).await?;
        }
    }

    Ok(())
}

fn init_logging(args: &ConfigArgs) -> anyhow::Result<WorkerGuard> {
    let logs_dir = canonical_logs_dir_from_root(&resolve_state_dir(args.state_dir.clone()));
    let (guard, log_info) = init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            status: Some("ok"),
            detail: Some("engine jsonl logging initialized"),
            ..ObservabilityEvent::new("logging.initialized", "engine.main")
        },
    );
    info!("engine logging initialized: {:?}", log_info);
    Ok(guard)
}

async fn open_config(args: &ConfigArgs) -> anyhow::Result<ConfigStore> {
    let path = args
        .config
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| resolve_state_dir(args.state_dir.clone()).join("config.json"));
    ConfigStore::new(path, build_cli_overrides(args)).await
}

async fn load_engine_config(args: &ConfigArgs) -> anyhow::Result<EngineConfig> {
    let config = open_config(args).await?.get().await;
    config.validate().context("effective configuration is invalid")?;
    Ok(config)
}

fn build_cli_overrides(args: &ConfigArgs) -> Option<Value> {
    let mut root = serde_json::Map::new();
    if let Some(ttl) = args.ttl_ms {
        root.insert("defaultRunTtlMs".to_string(), Value::from(ttl));
    }
    if let Some(attempts) = args.max_step_attempts {
        root.insert("maxStepAttempts".to_string(), Value::from(attempts));
    }
    if args.auto_reject {
        root.insert("autoRejectOnFailure".to_string(), Value::Bool(true));
    }
    if root.is_empty() {
        return None;
    }
    Some(Value::Object(root))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag.filter(|dir| !dir.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|dir| dir.join("overseer"))
        .unwrap_or_else(|| PathBuf::from(".overseer"))
}

fn read_input(input: &str) -> anyhow::Result<String> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    if let Some(path) = input.strip_prefix('@') {
        return std::fs::read_to_string(path).with_context(|| format!("reading {}", path));
    }
    Ok(input.to_string())
}

fn read_json_input(input: &str) -> anyhow::Result<Value> {
    Ok(serde_json::from_str(&read_input(input)?)?)
}

/// Accepts a bare plan or a request-shaped object carrying one under `plan`.
fn parse_plan(value: Value) -> anyhow::Result<Plan> {
    let value = match value {
        Value::Object(mut map) if map.contains_key("plan") => map.remove("plan").unwrap_or_default(),
        other => other,
    };
    let plan: Plan = serde_json::from_value(value).context("plan json is not a valid plan")?;
    if plan.instructions.trim().is_empty() {
        anyhow::bail!("plan instructions are required");
    }
    Ok(plan)
}

fn parse_frames(raw: &str) -> anyhow::Result<Vec<FrameTimings>> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("frame on line {}", i + 1))
        })
        .collect()
}

/// Succeeds every step unless its params say otherwise: `delayMs` sleeps
/// (cancellable), `fail` fails it, `retryable` marks that failure retryable.
struct DryRunExecutor;

#[async_trait]
impl StepExecutor for DryRunExecutor {
    async fn execute(&self, ctx: StepContext, step: &PlanStep) -> StepResult {
        let delay = step.params.get("delayMs").and_then(Value::as_u64).unwrap_or(0);
        if delay > 0 {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return StepResult::cancelled(),
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }
        if step.params.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            let retryable = step
                .params
                .get("retryable")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            return StepResult::failure(
                retryable,
                "test_failure",
                format!("step {} is marked to fail", step.node_id),
            );
        }
        StepResult::success().with_artifacts(StepArtifacts {
            focused_element: Some(step.node_id.clone()),
            ..StepArtifacts::default()
        })
    }
}

async fn dry_run(config: EngineConfig, request: RunRequest) -> anyhow::Result<RunStatus> {
    let clock = SystemClock::shared();
    let orchestrator = RunOrchestrator::new(
        config,
        clock.clone(),
        OrchestratorDeps {
            executor: Arc::new(DryRunExecutor),
            sandbox: Arc::new(InMemorySandboxProvider::new(clock)),
            sink: Arc::new(NoopEventSink),
            repository: Arc::new(MemoryRunRepository::new()),
            tracker: None,
        },
    );
    orchestrator.start();

    let run_id = orchestrator
        .submit(request)
        .await
        .map_err(|err| anyhow::anyhow!("submit failed ({}): {}", err.kind(), err))?;
    info!("dry-run admitted as {}", run_id);

    let interrupt = {
        let orchestrator = orchestrator.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling {}", run_id);
                let _ = orchestrator.cancel(&run_id);
            }
        })
    };

    let mut events = orchestrator.events(&run_id, 0).await?;
    while let Some(event) = events.next().await {
        write_json_line(&event)?;
    }
    let status = orchestrator.wait_terminal(&run_id).await?;
    interrupt.abort();

    let diff = orchestrator.diff(&run_id).await?;
    info!(
        "dry-run {} finished as {} ({} staged files)",
        run_id,
        status,
        diff.files.len()
    );
    orchestrator.shutdown().await;
    Ok(status)
}

async fn aggregate_frames(config: &EngineConfig, frames: Vec<FrameTimings>) -> anyhow::Result<()> {
    let clock = SystemClock::shared();
    let collectors = FrameCollectorRegistry::new(FrameCollectorConfig::from(&config.frame), clock.clone());
    let breakers = BreakerRegistry::new(BreakerConfig::from(&config.breaker), clock);
    let mut sessions = BTreeSet::new();

    for frame in frames {
        let collector = collectors.get_or_create(&frame.session_id);
        sessions.insert(frame.session_id.clone());
        collector.record(frame);
        if collector.should_broadcast() {
            let stats = collector.aggregate();
            match breakers
                .call(FRAME_STATS_BREAKER, async { write_json_line(&stats) })
                .await
            {
                Ok(()) => {}
                Err(BreakerError::Open { .. }) => {
                    tracing::debug!("frame stats output suspended for {}", stats.session_id)
                }
                Err(err) => tracing::warn!("frame stats output failed: {}", err),
            }
        }
    }

    for session_id in &sessions {
        if let Some(collector) = collectors.get(session_id) {
            write_json_line(&collector.aggregate())?;
        }
    }
    info!(
        "aggregated {} sessions; breakers: {:?}",
        collectors.count(),
        breakers.stats()
    );
    Ok(())
}

fn write_json_line<T: Serialize>(value: &T) -> std::io::Result<()> {
    let line = serde_json::to_string(value).map_err(std::io::Error::other)?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn cli_overrides_only_carry_given_flags() {
        assert!(build_cli_overrides(&ConfigArgs::default()).is_none());
        let overrides = build_cli_overrides(&ConfigArgs {
            ttl_ms: Some(5_000),
            auto_reject: true,
            ..ConfigArgs::default()
        })
        .expect("some");
        assert_eq!(overrides["defaultRunTtlMs"], 5_000);
        assert_eq!(overrides["autoRejectOnFailure"], true);
        assert!(overrides.get("maxStepAttempts").is_none());
    }

    #[test]
    fn plan_parses_bare_or_wrapped() {
        let bare = json!({"instructions": "click through", "steps": [{"nodeId": "a", "stepType": "click"}]});
        assert_eq!(parse_plan(bare.clone()).expect("bare").steps.len(), 1);
        let wrapped = json!({"scopePath": "/src", "plan": bare});
        assert_eq!(parse_plan(wrapped).expect("wrapped").instructions, "click through");
        assert!(parse_plan(json!({"instructions": " "})).is_err());
    }

    #[test]
    fn frames_parse_from_array_or_lines() {
        let frame = json!({
            "frameId": "f1", "sessionId": "s", "sequenceNum": 1, "timestamp": 1_000,
            "captureMs": 10.0, "compareMs": 1.0, "wsSendMs": 1.0, "driverTotalMs": 12.0,
            "frameBytes": 100
        });
        let array = serde_json::to_string(&json!([frame, frame])).expect("array");
        assert_eq!(parse_frames(&array).expect("array").len(), 2);
        let lines = format!("{}\n\n{}\n", frame, frame);
        assert_eq!(parse_frames(&lines).expect("lines").len(), 2);
        assert!(parse_frames("{\"frameId\": 1}").is_err());
    }

    #[test]
    fn config_file_input_reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plan.json");
        std::fs::write(&path, r#"{"instructions":"x"}"#).expect("write");
        let value = read_json_input(&format!("@{}", path.display())).expect("read");
        assert_eq!(value["instructions"], "x");
    }

    #[tokio::test]
    async fn dry_run_executor_honours_params() {
        let ctx = StepContext {
            run_id: "run_1".into(),
            step_index: 0,
            attempt: 1,
            sandbox_id: "sbx_1".into(),
            work_dir: "/tmp".into(),
            cancel: CancellationToken::new(),
        };
        let ok = DryRunExecutor
            .execute(ctx.clone(), &PlanStep::new("a", "click"))
            .await;
        assert!(ok.outcome.is_success());

        let failing = PlanStep::new("b", "click").with_params(json!({"fail": true, "retryable": true}));
        assert!(DryRunExecutor.execute(ctx.clone(), &failing).await.outcome.is_retryable());

        ctx.cancel.cancel();
        let slow = PlanStep::new("c", "wait").with_params(json!({"delayMs": 60_000}));
        assert_eq!(
            DryRunExecutor.execute(ctx, &slow).await.outcome,
            overseer_types::StepOutcome::Cancelled
        );
    }

    #[tokio::test]
    async fn dry_run_succeeds_for_a_simple_plan() {
        let plan = Plan::new(
            "smoke",
            vec![PlanStep::new("a", "click"), PlanStep::new("b", "type")],
        );
        let status = dry_run(
            EngineConfig::default(),
            RunRequest::new("/", "/tmp/overseer-dry-run", "tester", plan),
        )
        .await
        .expect("dry run");
        assert_eq!(status, RunStatus::Succeeded);
    }
}
