use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-frame stopwatch record across capture, transport and broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrameTimings {
    pub frame_id: String,
    pub session_id: String,
    pub sequence_num: u64,
    /// Unix epoch milliseconds at capture start.
    pub timestamp: i64,
    pub capture_ms: f64,
    pub compare_ms: f64,
    pub ws_send_ms: f64,
    pub driver_total_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_receive_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_broadcast_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_total_ms: Option<f64>,
    pub frame_bytes: u64,
    #[serde(default)]
    pub skipped: bool,
}

impl FrameTimings {
    pub fn end_to_end_ms(&self) -> f64 {
        self.driver_total_ms + self.api_total_ms.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bottleneck {
    Capture,
    Encode,
    Network,
    Decode,
    Draw,
    None,
}

impl Bottleneck {
    pub fn as_str(self) -> &'static str {
        match self {
            Bottleneck::Capture => "capture",
            Bottleneck::Encode => "encode",
            Bottleneck::Network => "network",
            Bottleneck::Decode => "decode",
            Bottleneck::Draw => "draw",
            Bottleneck::None => "none",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrameStatsAggregated {
    pub session_id: String,
    pub frame_count: u64,
    pub skip_count: u64,
    pub sample_count: usize,
    pub capture: LatencyPercentiles,
    pub end_to_end: LatencyPercentiles,
    pub actual_fps: f64,
    pub target_fps: f64,
    pub avg_frame_bytes: f64,
    pub bandwidth_bytes_per_sec: f64,
    pub primary_bottleneck: Bottleneck,
    pub bottleneck_description: String,
    pub computed_at: DateTime<Utc>,
}
