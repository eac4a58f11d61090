use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

const MIN_SUBSCRIBER_UPDATE_BUFFER: usize = 16;
const MIN_SUBSCRIBER_COMPLETION_BUFFER: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub retry_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            retry_interval_ms: 30_000,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameSettings {
    pub buffer_size: usize,
    pub target_fps: f64,
    pub broadcast_every_n: u64,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            buffer_size: 600,
            target_fps: 60.0,
            broadcast_every_n: 60,
        }
    }
}

/// Typed view of the effective engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub default_run_ttl_ms: u64,
    pub max_step_attempts: u32,
    pub event_buffer_size: usize,
    pub subscriber_update_buffer: usize,
    pub subscriber_completion_buffer: usize,
    pub slow_subscriber_timeout_ms: u64,
    pub async_retention_window_ms: u64,
    pub auto_reject_on_failure: bool,
    pub breaker: BreakerSettings,
    pub frame: FrameSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_run_ttl_ms: 30 * 60 * 1000,
            max_step_attempts: 1,
            event_buffer_size: 1024,
            subscriber_update_buffer: 100,
            subscriber_completion_buffer: 10,
            slow_subscriber_timeout_ms: 5_000,
            async_retention_window_ms: 10 * 60 * 1000,
            auto_reject_on_failure: false,
            breaker: BreakerSettings::default(),
            frame: FrameSettings::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl EngineConfig {
    pub fn default_run_ttl(&self) -> Duration {
        Duration::from_millis(self.default_run_ttl_ms)
    }

    pub fn slow_subscriber_timeout(&self) -> Duration {
        Duration::from_millis(self.slow_subscriber_timeout_ms)
    }

    pub fn async_retention_window(&self) -> Duration {
        Duration::from_millis(self.async_retention_window_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_run_ttl_ms == 0 {
            return Err(ConfigError::Invalid("defaultRunTtlMs must be > 0".into()));
        }
        if self.max_step_attempts == 0 {
            return Err(ConfigError::Invalid("maxStepAttempts must be >= 1".into()));
        }
        if self.event_buffer_size == 0 {
            return Err(ConfigError::Invalid("eventBufferSize must be > 0".into()));
        }
        if self.subscriber_update_buffer < MIN_SUBSCRIBER_UPDATE_BUFFER {
            return Err(ConfigError::Invalid(format!(
                "subscriberUpdateBuffer must be >= {}",
                MIN_SUBSCRIBER_UPDATE_BUFFER
            )));
        }
        if self.subscriber_completion_buffer < MIN_SUBSCRIBER_COMPLETION_BUFFER {
            return Err(ConfigError::Invalid(format!(
                "subscriberCompletionBuffer must be >= {}",
                MIN_SUBSCRIBER_COMPLETION_BUFFER
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failureThreshold must be >= 1".into(),
            ));
        }
        if self.frame.buffer_size == 0 {
            return Err(ConfigError::Invalid("frame.bufferSize must be > 0".into()));
        }
        if !(self.frame.target_fps > 0.0) {
            return Err(ConfigError::Invalid("frame.targetFps must be > 0".into()));
        }
        if self.frame.broadcast_every_n == 0 {
            return Err(ConfigError::Invalid(
                "frame.broadcastEveryN must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Layered JSON configuration: global < project < env < runtime < cli.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        let global_path = resolve_global_config_path();
        Self::with_global_path(project_path, global_path, cli_overrides).await
    }

    pub async fn with_global_path(
        project_path: PathBuf,
        global_path: PathBuf,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let global = read_json_file(&global_path).await?;
        let project = read_json_file(&project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> EngineConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("effective config did not parse, using defaults: {}", err);
                EngineConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|err| {
        tracing::warn!("ignoring unparseable config {}: {}", path.display(), err);
        empty_object()
    }))
}

fn resolve_global_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("OVERSEER_GLOBAL_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("overseer").join("config.json");
    }
    PathBuf::from(".overseer/global_config.json")
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();

    if let Some(v) = lookup("OVERSEER_DEFAULT_RUN_TTL_MS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "defaultRunTtlMs": v }));
    }
    if let Some(v) = lookup("OVERSEER_MAX_STEP_ATTEMPTS").and_then(|v| v.trim().parse::<u32>().ok())
    {
        deep_merge(&mut root, &json!({ "maxStepAttempts": v }));
    }
    if let Some(v) =
        lookup("OVERSEER_EVENT_BUFFER_SIZE").and_then(|v| v.trim().parse::<usize>().ok())
    {
        deep_merge(&mut root, &json!({ "eventBufferSize": v }));
    }
    if let Some(v) = lookup("OVERSEER_AUTO_REJECT_ON_FAILURE").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "autoRejectOnFailure": v }));
    }
    if let Some(v) = lookup("OVERSEER_BREAKER_FAILURE_THRESHOLD")
        .and_then(|v| v.trim().parse::<u32>().ok())
    {
        deep_merge(&mut root, &json!({ "breaker": { "failureThreshold": v } }));
    }
    if let Some(v) =
        lookup("OVERSEER_FRAME_TARGET_FPS").and_then(|v| v.trim().parse::<f64>().ok())
    {
        deep_merge(&mut root, &json!({ "frame": { "targetFps": v } }));
    }

    root
}

fn parse_bool_like(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}
