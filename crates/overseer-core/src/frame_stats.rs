use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use overseer_types::{Bottleneck, FrameStatsAggregated, FrameTimings, LatencyPercentiles};

use crate::clock::SharedClock;
use crate::config::FrameSettings;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameCollectorConfig {
    pub buffer_size: usize,
    pub target_fps: f64,
    pub broadcast_every_n: u64,
}

impl Default for FrameCollectorConfig {
    fn default() -> Self {
        Self::from(&FrameSettings::default())
    }
}

impl From<&FrameSettings> for FrameCollectorConfig {
    fn from(settings: &FrameSettings) -> Self {
        Self {
            buffer_size: settings.buffer_size.max(1),
            target_fps: if settings.target_fps > 0.0 {
                settings.target_fps
            } else {
                60.0
            },
            broadcast_every_n: settings.broadcast_every_n.max(1),
        }
    }
}

struct FrameRing {
    frames: VecDeque<FrameTimings>,
    frame_count: u64,
    skip_count: u64,
}

/// Ring-buffered frame timings for one session.
pub struct FrameCollector {
    session_id: String,
    config: FrameCollectorConfig,
    clock: SharedClock,
    ring: Mutex<FrameRing>,
}

impl FrameCollector {
    pub fn new(
        session_id: impl Into<String>,
        config: FrameCollectorConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            clock,
            ring: Mutex::new(FrameRing {
                frames: VecDeque::with_capacity(config.buffer_size),
                frame_count: 0,
                skip_count: 0,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Appends a frame, evicting the oldest when full. Returns the running frame count.
    pub fn record(&self, frame: FrameTimings) -> u64 {
        let mut ring = self.ring.lock();
        if ring.frames.len() >= self.config.buffer_size {
            ring.frames.pop_front();
        }
        if frame.skipped {
            ring.skip_count += 1;
        }
        ring.frame_count += 1;
        ring.frames.push_back(frame);
        ring.frame_count
    }

    pub fn frame_count(&self) -> u64 {
        self.ring.lock().frame_count
    }

    pub fn skip_count(&self) -> u64 {
        self.ring.lock().skip_count
    }

    pub fn len(&self) -> usize {
        self.ring.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn should_broadcast(&self) -> bool {
        let count = self.frame_count();
        count > 0 && count % self.config.broadcast_every_n == 0
    }

    pub fn aggregate(&self) -> FrameStatsAggregated {
        let (mut capture, mut end_to_end, window_ms, bytes, non_skipped, frame_count, skip_count) = {
            let ring = self.ring.lock();
            let capture: Vec<f64> = ring.frames.iter().map(|f| f.capture_ms).collect();
            let end_to_end: Vec<f64> = ring
                .frames
                .iter()
                .map(FrameTimings::end_to_end_ms)
                .collect();
            let window_ms = match (ring.frames.front(), ring.frames.back()) {
                (Some(oldest), Some(newest)) => (newest.timestamp - oldest.timestamp).max(0),
                _ => 0,
            };
            let (bytes, non_skipped) = ring
                .frames
                .iter()
                .filter(|f| !f.skipped)
                .fold((0u64, 0u64), |(bytes, n), f| (bytes + f.frame_bytes, n + 1));
            (
                capture,
                end_to_end,
                window_ms,
                bytes,
                non_skipped,
                ring.frame_count,
                ring.skip_count,
            )
        };

        sort_samples(&mut capture);
        sort_samples(&mut end_to_end);
        let capture = percentiles(&capture);
        let end_to_end_pct = percentiles(&end_to_end);

        let window_sec = window_ms as f64 / 1000.0;
        let sample_count = end_to_end.len();
        let actual_fps = if window_sec > 0.0 {
            round2(sample_count as f64 / window_sec)
        } else {
            0.0
        };
        let avg_frame_bytes = if non_skipped > 0 {
            round2(bytes as f64 / non_skipped as f64)
        } else {
            0.0
        };
        let bandwidth_bytes_per_sec = if window_sec > 0.0 {
            round2(bytes as f64 / window_sec)
        } else {
            0.0
        };

        let (primary_bottleneck, bottleneck_description) = classify_bottleneck(
            capture.p50,
            capture.p90,
            end_to_end_pct.p90,
            self.config.target_fps,
        );

        FrameStatsAggregated {
            session_id: self.session_id.clone(),
            frame_count,
            skip_count,
            sample_count,
            capture,
            end_to_end: end_to_end_pct,
            actual_fps,
            target_fps: self.config.target_fps,
            avg_frame_bytes,
            bandwidth_bytes_per_sec,
            primary_bottleneck,
            bottleneck_description,
            computed_at: self.clock.now(),
        }
    }
}

fn sort_samples(samples: &mut [f64]) {
    samples.sort_by(|a, b| a.total_cmp(b));
}

/// p50/p90/p99/max over an ascending slice, rounded to two decimals.
pub fn percentiles(sorted: &[f64]) -> LatencyPercentiles {
    match sorted.last() {
        None => LatencyPercentiles::default(),
        Some(max) => LatencyPercentiles {
            p50: round2(percentile(sorted, 0.50)),
            p90: round2(percentile(sorted, 0.90)),
            p99: round2(percentile(sorted, 0.99)),
            max: round2(*max),
        },
    }
}

/// Linear interpolation between the ranks around `p * (n - 1)`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;
    let frac = index - lower as f64;
    sorted[lower] * (1.0 - frac) + sorted[upper] * frac
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Deterministic function of the four inputs; `target_fps` sets the frame budget.
pub fn classify_bottleneck(
    capture_p50: f64,
    capture_p90: f64,
    e2e_p90: f64,
    target_fps: f64,
) -> (Bottleneck, String) {
    let budget_ms = if target_fps > 0.0 {
        1000.0 / target_fps
    } else {
        return (Bottleneck::None, "no frame budget configured".to_string());
    };

    if capture_p90 > 0.8 * budget_ms {
        return (
            Bottleneck::Capture,
            format!(
                "capture P90 {:.2}ms exceeds 80% of the {:.2}ms frame budget",
                capture_p90, budget_ms
            ),
        );
    }
    if capture_p50 > 100.0 {
        return (
            Bottleneck::Capture,
            format!("capture P50 {:.2}ms exceeds 100ms", capture_p50),
        );
    }
    if e2e_p90 > 1.5 * budget_ms && capture_p90 < 0.5 * budget_ms {
        return (
            Bottleneck::Network,
            format!(
                "end-to-end P90 {:.2}ms vs capture P90 {:.2}ms: ~{:.2}ms transport overhead",
                e2e_p90,
                capture_p90,
                e2e_p90 - capture_p90
            ),
        );
    }
    (
        Bottleneck::None,
        format!("pipeline within the {:.2}ms frame budget", budget_ms),
    )
}

/// Session-keyed collectors.
pub struct FrameCollectorRegistry {
    config: FrameCollectorConfig,
    clock: SharedClock,
    collectors: RwLock<HashMap<String, Arc<FrameCollector>>>,
}

impl FrameCollectorRegistry {
    pub fn new(config: FrameCollectorConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            collectors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, session_id: &str) -> Arc<FrameCollector> {
        if let Some(collector) = self.collectors.read().get(session_id) {
            return Arc::clone(collector);
        }
        let mut collectors = self.collectors.write();
        let collector = collectors.entry(session_id.to_string()).or_insert_with(|| {
            Arc::new(FrameCollector::new(
                session_id,
                self.config,
                self.clock.clone(),
            ))
        });
        Arc::clone(collector)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<FrameCollector>> {
        self.collectors.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<FrameCollector>> {
        self.collectors.write().remove(session_id)
    }

    pub fn count(&self) -> usize {
        self.collectors.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn frame(seq: u64, capture_ms: f64, driver_ms: f64, api_ms: Option<f64>) -> FrameTimings {
        FrameTimings {
            frame_id: format!("f{seq}"),
            session_id: "s1".to_string(),
            sequence_num: seq,
            timestamp: 1_700_000_000_000 + (seq as i64) * 100,
            capture_ms,
            compare_ms: 1.0,
            ws_send_ms: 1.0,
            driver_total_ms: driver_ms,
            api_receive_ms: None,
            api_broadcast_ms: None,
            api_total_ms: api_ms,
            frame_bytes: 1000,
            skipped: false,
        }
    }

    fn collector(buffer_size: usize) -> FrameCollector {
        FrameCollector::new(
            "s1",
            FrameCollectorConfig {
                buffer_size,
                target_fps: 60.0,
                broadcast_every_n: 60,
            },
            Arc::new(ManualClock::default()),
        )
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let samples = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&samples, 0.5), 25.0);
        assert!((percentile(&samples, 0.9) - 37.0).abs() < 1e-9);
        assert_eq!(percentile(&[5.0], 0.99), 5.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn percentiles_are_monotonic() {
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        for len in [1usize, 2, 3, 7, 50, 600] {
            let mut samples: Vec<f64> = (0..len)
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    (seed % 10_000) as f64 / 7.0
                })
                .collect();
            sort_samples(&mut samples);
            let pct = percentiles(&samples);
            assert!(pct.p50 <= pct.p90, "{pct:?}");
            assert!(pct.p90 <= pct.p99, "{pct:?}");
            assert!(pct.p99 <= pct.max, "{pct:?}");
        }
    }

    #[test]
    fn ring_evicts_oldest_but_counts_are_monotonic() {
        let collector = collector(3);
        for seq in 0..5 {
            let mut f = frame(seq, seq as f64, 10.0, None);
            f.skipped = seq == 4;
            collector.record(f);
        }
        assert_eq!(collector.len(), 3);
        assert_eq!(collector.frame_count(), 5);
        assert_eq!(collector.skip_count(), 1);
        let stats = collector.aggregate();
        assert_eq!(stats.capture.max, 4.0);
        assert_eq!(stats.capture.p50, 3.0);
        assert_eq!(stats.sample_count, 3);
    }

    #[test]
    fn aggregate_computes_throughput_over_window() {
        let collector = collector(600);
        for seq in 0..11 {
            collector.record(frame(seq, 5.0, 8.0, Some(2.0)));
        }
        let mut skipped = frame(11, 5.0, 8.0, Some(2.0));
        skipped.skipped = true;
        skipped.frame_bytes = 0;
        collector.record(skipped);

        let stats = collector.aggregate();
        assert_eq!(stats.end_to_end.p50, 10.0);
        // 12 frames spread over 1.1s
        assert_eq!(stats.actual_fps, round2(12.0 / 1.1));
        assert_eq!(stats.avg_frame_bytes, 1000.0);
        assert_eq!(stats.bandwidth_bytes_per_sec, round2(11_000.0 / 1.1));
    }

    #[test]
    fn empty_collector_aggregates_to_zeroes() {
        let stats = collector(10).aggregate();
        assert_eq!(stats.capture, LatencyPercentiles::default());
        assert_eq!(stats.actual_fps, 0.0);
        assert_eq!(stats.avg_frame_bytes, 0.0);
        assert_eq!(stats.primary_bottleneck, Bottleneck::None);
    }

    #[test]
    fn classifier_branches() {
        assert_eq!(classify_bottleneck(10.0, 14.0, 20.0, 60.0).0, Bottleneck::Capture);
        assert_eq!(classify_bottleneck(120.0, 10.0, 20.0, 5.0).0, Bottleneck::Capture);
        let (kind, description) = classify_bottleneck(4.0, 5.0, 30.0, 60.0);
        assert_eq!(kind, Bottleneck::Network);
        assert!(description.contains("25.00ms"));
        assert_eq!(classify_bottleneck(4.0, 5.0, 12.0, 60.0).0, Bottleneck::None);
        assert_eq!(
            classify_bottleneck(4.0, 5.0, 30.0, 60.0),
            classify_bottleneck(4.0, 5.0, 30.0, 60.0)
        );
    }

    #[test]
    fn broadcast_gate_fires_every_n_frames() {
        let collector = collector(600);
        assert!(!collector.should_broadcast());
        for seq in 0..59 {
            collector.record(frame(seq, 1.0, 1.0, None));
        }
        assert!(!collector.should_broadcast());
        collector.record(frame(59, 1.0, 1.0, None));
        assert!(collector.should_broadcast());
        collector.record(frame(60, 1.0, 1.0, None));
        assert!(!collector.should_broadcast());
    }

    #[test]
    fn registry_is_session_keyed() {
        let registry = FrameCollectorRegistry::new(
            FrameCollectorConfig::default(),
            Arc::new(ManualClock::default()),
        );
        let a = registry.get_or_create("a");
        assert!(Arc::ptr_eq(&a, &registry.get_or_create("a")));
        registry.get_or_create("b");
        assert_eq!(registry.count(), 2);
        assert!(registry.remove("a").is_some());
        assert!(registry.get("a").is_none());
        assert_eq!(registry.count(), 1);
    }
}
