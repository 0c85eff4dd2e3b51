//! Time source for timestamps, backoff sleeps and health-check ticks

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);

    /// Wait out one health-check period
    async fn tick(&self, period: Duration) {
        tokio::time::sleep(period).await;
    }
}

/// Wall clock with tokio timers (honours `tokio::time::pause`)
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock whose sleeps return at once and are only recorded
///
/// Ticks are recorded too but still wait on tokio time, so periodic work
/// does not spin.
#[derive(Debug, Default)]
pub struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
    ticks: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every requested sleep, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Every health-check period waited on, in order
    pub fn ticks(&self) -> Vec<Duration> {
        self.ticks.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }

    async fn tick(&self, period: Duration) {
        if let Ok(mut ticks) = self.ticks.lock() {
            ticks.push(period);
        }
        tokio::time::sleep(period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_clock_does_not_wait() {
        let clock = RecordingClock::new();
        clock.sleep(Duration::from_secs(3600)).await;
        clock.sleep(Duration::from_millis(5)).await;
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(3600), Duration::from_millis(5)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_clock_ticks_wait() {
        let clock = RecordingClock::new();
        let start = tokio::time::Instant::now();
        clock.tick(Duration::from_secs(10)).await;
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(clock.ticks(), vec![Duration::from_secs(10)]);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let start = tokio::time::Instant::now();
        TokioClock.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
