mod async_op;
mod event;
mod frame;
mod lock;
mod run;
mod sandbox;
mod step;

pub use async_op::*;
pub use event::*;
pub use frame::*;
pub use lock::*;
pub use run::*;
pub use sandbox::*;
pub use step::*;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Untyped in-process event as carried by the engine event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub properties: Value,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }
}

pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}
