//! Provides backoff timing control for pod states such as ImagePullBackoff and
//! CrashLoopBackoff.
//!
//! [`BackoffStrategy`] paces a single retry loop. [`Backoff`] tracks one back-off window per
//! key (a container or an image of a pod) against a [`Clock`], so that the sync loop can ask
//! whether an item is still backing off without sleeping.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Determines how long to back off before performing a retry.
#[async_trait::async_trait]
pub trait BackoffStrategy: Send {
    /// Resets the strategy after a success.
    fn reset(&mut self);
    /// Gets how long to wait before retrying.
    fn next_duration(&mut self) -> Duration;
    /// Waits the prescribed amount of time (as per `next_duration`).
    async fn wait(&mut self) {
        tokio::time::sleep(self.next_duration()).await
    }
}

/// A `BackoffStrategy` in which the durations increase exponentially
/// until hitting a cap.
pub struct ExponentialBackoffStrategy {
    base_duration: Duration,
    cap: Duration,
    last_duration: Duration,
}

impl Default for ExponentialBackoffStrategy {
    /// Gets a backoff strategy that adheres to the Kubernetes defaults.
    fn default() -> Self {
        Self {
            base_duration: Duration::from_secs(10),
            cap: Duration::from_secs(300),
            last_duration: Duration::from_secs(0),
        }
    }
}

impl ExponentialBackoffStrategy {
    fn capped_next_duration(&self) -> Duration {
        let next_duration = if self.last_duration == Duration::from_secs(0) {
            self.base_duration
        } else {
            self.last_duration * 2
        };

        if next_duration > self.cap {
            self.cap
        } else {
            next_duration
        }
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.last_duration = Duration::from_secs(0);
    }

    fn next_duration(&mut self) -> Duration {
        let next_duration = self.capped_next_duration();
        self.last_duration = next_duration;
        next_duration
    }
}

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FakeClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl FakeClock {
    /// A clock stopped at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        FakeClock {
            now: std::sync::Mutex::new(now),
        }
    }

    /// Moves the clock forward.
    pub fn step(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = *now + by;
    }

    /// Sets the clock.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone, Copy, Debug)]
struct BackoffEntry {
    backoff: Duration,
    last_update: DateTime<Utc>,
}

/// Per-key exponential back-off. Each call to [`Backoff::next`] doubles the window of a key up
/// to the cap; an entry that has not been touched for twice the cap starts over.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, BackoffEntry>>,
}

impl Backoff {
    /// A back-off starting at `initial` and capped at `max`, on the wall clock.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self::with_clock(initial, max, Arc::new(RealClock))
    }

    /// A back-off on the given clock.
    pub fn with_clock(initial: Duration, max: Duration, clock: Arc<dyn Clock>) -> Self {
        Backoff {
            initial,
            max,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn has_expired(&self, event_time: DateTime<Utc>, last_update: DateTime<Utc>) -> bool {
        elapsed(last_update, event_time) > self.max * 2
    }

    /// The current window of a key, zero if it has none.
    pub async fn get(&self, key: &str) -> Duration {
        self.entries
            .lock()
            .await
            .get(key)
            .map(|e| e.backoff)
            .unwrap_or_default()
    }

    /// Records a failure of `key` at `event_time`, growing its window.
    pub async fn next(&self, key: &str, event_time: DateTime<Utc>) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let backoff = match entries.get(key) {
            Some(e) if !self.has_expired(event_time, e.last_update) => {
                std::cmp::min(e.backoff * 2, self.max)
            }
            _ => self.initial,
        };
        entries.insert(
            key.to_owned(),
            BackoffEntry {
                backoff,
                last_update: now,
            },
        );
    }

    /// Forgets a key.
    pub async fn reset(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    /// Whether less than the window of `key` has passed since `event_time`.
    pub async fn is_in_back_off_since(&self, key: &str, event_time: DateTime<Utc>) -> bool {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(e) if !self.has_expired(now, e.last_update) => {
                elapsed(event_time, now) < e.backoff
            }
            _ => false,
        }
    }

    /// Whether `event_time` falls within the window that started at the last update of `key`.
    pub async fn is_in_back_off_since_update(&self, key: &str, event_time: DateTime<Utc>) -> bool {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(e) if !self.has_expired(now, e.last_update) => {
                elapsed(e.last_update, event_time) < e.backoff
            }
            _ => false,
        }
    }

    /// Drops entries not updated for twice the cap.
    pub async fn gc(&self) {
        let now = self.clock.now();
        let max = self.max;
        self.entries
            .lock()
            .await
            .retain(|_, e| elapsed(e.last_update, now) <= max * 2);
    }
}

// Negative spans count as zero.
fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn fake_backoff() -> (Arc<FakeClock>, Backoff) {
        let clock = Arc::new(FakeClock::new(Utc.timestamp_opt(1_600_000_000, 0).unwrap()));
        let backoff = Backoff::with_clock(
            Duration::from_secs(10),
            Duration::from_secs(300),
            clock.clone(),
        );
        (clock, backoff)
    }

    #[tokio::test]
    async fn keyed_backoff_doubles_up_to_cap() {
        let (clock, backoff) = fake_backoff();
        let mut expected = vec![10, 20, 40, 80, 160, 300, 300];
        expected.reverse();
        while let Some(secs) = expected.pop() {
            backoff.next("k", clock.now()).await;
            assert_eq!(backoff.get("k").await, Duration::from_secs(secs));
            clock.step(Duration::from_secs(1));
        }
        backoff.reset("k").await;
        assert_eq!(backoff.get("k").await, Duration::ZERO);
    }

    #[tokio::test]
    async fn keyed_backoff_window_is_measured_from_event() {
        let (clock, backoff) = fake_backoff();
        let failed_at = clock.now();
        backoff.next("k", failed_at).await;
        assert!(backoff.is_in_back_off_since("k", failed_at).await);
        assert!(backoff.is_in_back_off_since_update("k", failed_at).await);
        clock.step(Duration::from_secs(11));
        assert!(!backoff.is_in_back_off_since("k", failed_at).await);
        assert!(!backoff.is_in_back_off_since("other", failed_at).await);
    }

    #[tokio::test]
    async fn keyed_backoff_expires_after_twice_the_cap() {
        let (clock, backoff) = fake_backoff();
        backoff.next("k", clock.now()).await;
        backoff.next("k", clock.now()).await;
        assert_eq!(backoff.get("k").await, Duration::from_secs(20));
        clock.step(Duration::from_secs(601));
        backoff.next("k", clock.now()).await;
        assert_eq!(backoff.get("k").await, Duration::from_secs(10));

        clock.step(Duration::from_secs(601));
        backoff.gc().await;
        assert_eq!(backoff.get("k").await, Duration::ZERO);
    }

    #[test]
    fn first_backoff_is_10_seconds() {
        let mut backoff = ExponentialBackoffStrategy::default();
        assert_eq!(backoff.next_duration(), Duration::from_secs(10));
    }

    #[test]
    fn backoff_doubles_each_time() {
        let mut backoff = ExponentialBackoffStrategy::default();
        assert_eq!(backoff.next_duration(), Duration::from_secs(10));
        assert_eq!(backoff.next_duration(), Duration::from_secs(20));
        assert_eq!(backoff.next_duration(), Duration::from_secs(40));
        assert_eq!(backoff.next_duration(), Duration::from_secs(80));
    }

    #[test]
    fn after_reset_next_backoff_is_10_seconds() {
        let mut backoff = ExponentialBackoffStrategy::default();
        assert_eq!(backoff.next_duration(), Duration::from_secs(10));
        assert_eq!(backoff.next_duration(), Duration::from_secs(20));
        assert_eq!(backoff.next_duration(), Duration::from_secs(40));
        backoff.reset();
        assert_eq!(backoff.next_duration(), Duration::from_secs(10));
        assert_eq!(backoff.next_duration(), Duration::from_secs(20));
    }

    #[test]
    fn backoff_is_capped_at_5_minutes() {
        let mut backoff = ExponentialBackoffStrategy::default();
        assert_eq!(backoff.next_duration(), Duration::from_secs(10));
        assert_eq!(backoff.next_duration(), Duration::from_secs(20));
        assert_eq!(backoff.next_duration(), Duration::from_secs(40));
        assert_eq!(backoff.next_duration(), Duration::from_secs(80));
        assert_eq!(backoff.next_duration(), Duration::from_secs(160));
        assert_eq!(backoff.next_duration(), Duration::from_secs(300));
        assert_eq!(backoff.next_duration(), Duration::from_secs(300));
    }
}
