use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Fixed-interval driver. A tick that overruns the period delays the next
/// one; missed ticks are dropped, never replayed back to back.
#[derive(Debug, Clone)]
pub struct TickScheduler {
    period: Duration,
    running: Arc<AtomicBool>,
}

impl TickScheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ask the loop to exit before its next tick
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Drive `tick` until stopped. Returns the number of ticks run.
    pub async fn run<F, Fut>(&self, mut tick: F) -> u64
    where
        F: FnMut() -> Fut,
        Fut: Future,
    {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut ticks = 0;
        while self.is_running() {
            ticker.tick().await;
            if !self.is_running() {
                break;
            }
            tick().await;
            ticks += 1;
        }

        debug!(ticks = ticks, "Tick scheduler stopped");
        ticks
    }
}
