use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::watch;

/// Time source for every deadline, expiry and retry in the engine.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Resolves once `duration` has elapsed on this clock.
    fn timer(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn timer(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Clock that only moves when told to. Timers fire from `advance`/`set`.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<watch::Sender<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        let (tx, _rx) = watch::channel(start);
        Self { now: Arc::new(tx) }
    }

    pub fn advance(&self, duration: Duration) {
        let delta = to_chrono(duration);
        self.now.send_modify(|now| *now += delta);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.now.send_replace(at);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.borrow()
    }

    fn timer(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let deadline = self.now() + to_chrono(duration);
        let mut rx = self.now.subscribe();
        Box::pin(async move {
            loop {
                if *rx.borrow_and_update() >= deadline {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }
}

pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Elapsed wall time between two instants, clamped at zero.
pub fn elapsed_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_timer_fires_only_after_advance() {
        let clock = ManualClock::default();
        let mut timer = clock.timer(Duration::from_millis(50));

        let early = tokio::time::timeout(Duration::from_millis(20), &mut timer).await;
        assert!(early.is_err());

        clock.advance(Duration::from_millis(30));
        let still_early = tokio::time::timeout(Duration::from_millis(20), &mut timer).await;
        assert!(still_early.is_err());

        clock.advance(Duration::from_millis(20));
        tokio::time::timeout(Duration::from_millis(200), timer)
            .await
            .expect("timer should fire once the deadline is reached");
    }

    #[test]
    fn elapsed_between_clamps_negative() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(5);
        assert_eq!(elapsed_between(now, earlier), Duration::ZERO);
        assert_eq!(elapsed_between(earlier, now), Duration::from_secs(5));
    }
}
