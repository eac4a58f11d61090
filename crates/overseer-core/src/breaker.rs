use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use overseer_observability::{emit_event, ObservabilityEvent, ProcessKind};

use crate::clock::{elapsed_between, SharedClock};
use crate::config::BreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "halfOpen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub retry_interval: Duration,
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerSettings::default())
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            retry_interval: Duration::from_millis(settings.retry_interval_ms),
            timeout: Duration::from_millis(settings.timeout_ms),
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit '{name}' is open")]
    Open { name: String },
    #[error("circuit '{name}' call timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    pub failure_threshold: u32,
    pub retry_interval_ms: u64,
    pub timeout_ms: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
    probe_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
}

impl BreakerState {
    fn closed(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            last_success: None,
            last_state_change: now,
            probe_in_flight: false,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }

    fn transition(&mut self, next: CircuitState, now: DateTime<Utc>) -> Option<CircuitState> {
        if self.state == next {
            return None;
        }
        self.state = next;
        self.last_state_change = now;
        Some(next)
    }
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: SharedClock,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(BreakerState::closed(now)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Whether a call may proceed. Lazily moves `open` to `halfOpen` once the
    /// retry interval has passed since the last state change.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let (allowed, transition) = {
            let mut state = self.state.lock();
            let current = state.state;
            match current {
                CircuitState::Closed | CircuitState::HalfOpen => (true, None),
                CircuitState::Open => {
                    if self.retry_elapsed(&state, now) {
                        (true, state.transition(CircuitState::HalfOpen, now))
                    } else {
                        state.rejected_calls += 1;
                        (false, None)
                    }
                }
            }
        };
        self.report_transition(transition);
        allowed
    }

    /// Like [`CircuitBreaker::allow`], but admits at most one in-flight probe
    /// while half-open. Callers that get `true` must record an outcome or
    /// call [`CircuitBreaker::release_probe`].
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let (allowed, transition) = {
            let mut state = self.state.lock();
            let current = state.state;
            match current {
                CircuitState::Closed => (true, None),
                CircuitState::HalfOpen if !state.probe_in_flight => {
                    state.probe_in_flight = true;
                    (true, None)
                }
                CircuitState::Open if self.retry_elapsed(&state, now) => {
                    let transition = state.transition(CircuitState::HalfOpen, now);
                    state.probe_in_flight = true;
                    (true, transition)
                }
                CircuitState::HalfOpen | CircuitState::Open => {
                    state.rejected_calls += 1;
                    (false, None)
                }
            }
        };
        self.report_transition(transition);
        allowed
    }

    pub fn release_probe(&self) {
        self.state.lock().probe_in_flight = false;
    }

    pub fn record_success(&self) {
        let now = self.clock.now();
        let transition = {
            let mut state = self.state.lock();
            state.last_success = Some(now);
            state.total_successes += 1;
            state.probe_in_flight = false;
            let current = state.state;
            match current {
                CircuitState::Closed => {
                    state.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    state.failure_count = 0;
                    state.transition(CircuitState::Closed, now)
                }
                // A call admitted before the trip finished late; the open window stands.
                CircuitState::Open => None,
            }
        };
        self.report_transition(transition);
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let transition = {
            let mut state = self.state.lock();
            state.last_failure = Some(now);
            state.total_failures += 1;
            state.probe_in_flight = false;
            let current = state.state;
            match current {
                CircuitState::Closed => {
                    state.failure_count = state.failure_count.saturating_add(1);
                    if state.failure_count >= self.config.failure_threshold {
                        state.transition(CircuitState::Open, now)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => state.transition(CircuitState::Open, now),
                CircuitState::Open => None,
            }
        };
        self.report_transition(transition);
    }

    /// Forces `closed` and zeroes the failure count. Lifetime totals are kept.
    pub fn reset(&self) {
        let now = self.clock.now();
        let transition = {
            let mut state = self.state.lock();
            state.failure_count = 0;
            state.probe_in_flight = false;
            state.transition(CircuitState::Closed, now)
        };
        self.report_transition(transition);
    }

    /// Runs `call` behind the gate with the configured timeout, recording the outcome.
    pub async fn call<F, T, E>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        }
        let mut permit = ProbePermit {
            breaker: self,
            settled: false,
        };
        let timeout = self.clock.timer(self.config.timeout);
        let outcome = tokio::select! {
            biased;
            result = call => Some(result),
            _ = timeout => None,
        };
        permit.settled = true;
        match outcome {
            Some(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Some(Err(err)) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
            None => {
                self.record_failure();
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    timeout: self.config.timeout,
                })
            }
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let state = self.state.lock();
        BreakerStatus {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            last_failure: state.last_failure,
            last_success: state.last_success,
            last_state_change: state.last_state_change,
            failure_threshold: self.config.failure_threshold,
            retry_interval_ms: self.config.retry_interval.as_millis() as u64,
            timeout_ms: self.config.timeout.as_millis() as u64,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            rejected_calls: state.rejected_calls,
        }
    }

    fn retry_elapsed(&self, state: &BreakerState, now: DateTime<Utc>) -> bool {
        elapsed_between(state.last_state_change, now) >= self.config.retry_interval
    }

    fn report_transition(&self, transition: Option<CircuitState>) {
        let Some(next) = transition else {
            return;
        };
        let (event, level) = match next {
            CircuitState::Open => ("breaker.opened", Level::WARN),
            CircuitState::HalfOpen => ("breaker.half_open", Level::INFO),
            CircuitState::Closed => ("breaker.closed", Level::INFO),
        };
        let failures = self.failure_count().to_string();
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                event,
                component: "breaker",
                correlation_id: Some(&self.name),
                status: Some(next.as_str()),
                detail: Some(&failures),
                ..ObservabilityEvent::default()
            },
        );
    }
}

/// Frees a half-open probe slot if the guarded future is dropped before settling.
struct ProbePermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for ProbePermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_probe();
        }
    }
}

/// Named breakers, one per guarded collector.
pub struct BreakerRegistry {
    clock: SharedClock,
    default_config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            clock,
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with_config(name, self.default_config)
    }

    /// Returns the named breaker, creating it with `config` if absent.
    /// An existing breaker keeps its original config.
    pub fn get_with_config(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!("creating circuit breaker '{}'", name);
            Arc::new(CircuitBreaker::new(name, config, self.clock.clone()))
        });
        Arc::clone(breaker)
    }

    pub fn get_if_exists(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_status(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<BreakerStatus> = self
            .breakers
            .read()
            .values()
            .map(|breaker| breaker.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn stats(&self) -> RegistryStats {
        let breakers = self.breakers.read();
        let mut stats = RegistryStats {
            total: breakers.len(),
            ..RegistryStats::default()
        };
        for breaker in breakers.values() {
            match breaker.state() {
                CircuitState::Closed => stats.closed += 1,
                CircuitState::Open => stats.open += 1,
                CircuitState::HalfOpen => stats.half_open += 1,
            }
        }
        stats
    }

    pub fn open_breakers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .read()
            .values()
            .filter(|breaker| breaker.state() == CircuitState::Open)
            .map(|breaker| breaker.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn reset(&self, name: &str) -> bool {
        match self.get_if_exists(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    pub async fn call<F, T, E>(&self, name: &str, call: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.get(name).call(call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(threshold: u32) -> (ManualClock, CircuitBreaker) {
        let clock = ManualClock::default();
        let config = BreakerConfig {
            failure_threshold: threshold,
            retry_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        };
        let breaker = CircuitBreaker::new("collector", config, Arc::new(clock.clone()));
        (clock, breaker)
    }

    #[test]
    fn opens_on_exactly_the_threshold_failure() {
        let (_clock, breaker) = breaker(3);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 3);
        assert!(!breaker.allow());
    }

    #[test]
    fn success_in_closed_resets_consecutive_count() {
        let (_clock, breaker) = breaker(3);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 2);
    }

    #[test]
    fn half_open_after_retry_interval_then_closes() {
        let (clock, breaker) = breaker(1);
        breaker.record_failure();
        clock.advance(Duration::from_secs(29));
        assert!(!breaker.allow());
        clock.advance(Duration::from_secs(1));
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn failure_in_half_open_reopens_and_keeps_count() {
        let (clock, breaker) = breaker(2);
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(Duration::from_secs(30));
        assert!(breaker.allow());
        let before = breaker.status().last_state_change;
        clock.advance(Duration::from_secs(1));
        breaker.record_failure();
        let status = breaker.status();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failure_count, 2);
        assert!(status.last_state_change > before);
        assert!(!breaker.allow());
    }

    #[test]
    fn half_open_admits_a_single_probe() {
        let (clock, breaker) = breaker(1);
        breaker.record_failure();
        clock.advance(Duration::from_secs(30));
        assert!(breaker.try_acquire());
        assert!(!breaker.try_acquire());
        breaker.release_probe();
        assert!(breaker.try_acquire());
        assert_eq!(breaker.status().rejected_calls, 1);
    }

    #[test]
    fn reset_forces_closed() {
        let (_clock, breaker) = breaker(1);
        breaker.record_failure();
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.status().total_failures, 1);
    }

    #[tokio::test]
    async fn call_maps_errors_and_timeouts() {
        let clock = ManualClock::default();
        let config = BreakerConfig {
            failure_threshold: 2,
            retry_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(1),
        };
        let breaker = CircuitBreaker::new("probe", config, Arc::new(clock.clone()));

        let ok: Result<u32, BreakerError<String>> = breaker.call(async { Ok(7) }).await;
        assert_eq!(ok.expect("ok"), 7);

        let err = breaker
            .call(async { Err::<u32, _>("boom".to_string()) })
            .await
            .expect_err("inner error");
        assert!(matches!(err, BreakerError::Inner(ref msg) if msg == "boom"));

        let ticker = clock.clone();
        let advance = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            ticker.advance(Duration::from_secs(2));
        });
        let err = breaker
            .call(futures::future::pending::<Result<u32, String>>())
            .await
            .expect_err("timeout");
        advance.await.expect("advance task");
        assert!(matches!(err, BreakerError::Timeout { .. }));
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker
            .call(async { Ok::<u32, String>(1) })
            .await
            .expect_err("open");
        assert!(err.is_open());
    }

    #[test]
    fn registry_reuses_breakers_and_reports_stats() {
        let clock = ManualClock::default();
        let registry = BreakerRegistry::new(
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
            Arc::new(clock),
        );
        let a = registry.get("telemetry");
        let again = registry.get("telemetry");
        assert!(Arc::ptr_eq(&a, &again));
        registry.get("health");
        assert!(registry.get_if_exists("missing").is_none());

        a.record_failure();
        assert_eq!(registry.open_breakers(), vec!["telemetry".to_string()]);
        assert_eq!(
            registry.stats(),
            RegistryStats {
                total: 2,
                closed: 1,
                open: 1,
                half_open: 0
            }
        );
        assert_eq!(registry.list(), vec!["health".to_string(), "telemetry".to_string()]);

        assert!(registry.reset("telemetry"));
        assert!(!registry.reset("missing"));
        assert!(registry.open_breakers().is_empty());

        registry.get("health").record_failure();
        registry.reset_all();
        assert_eq!(registry.stats().closed, 2);
        assert_eq!(registry.list_status().len(), 2);
    }
}
