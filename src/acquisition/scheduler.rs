use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Fixed-interval poll driver with cooperative cancellation.
///
/// Cancellation is observed between ticks only; a poll already in flight runs
/// to completion and its result is the caller's to discard.
pub struct PollScheduler {
    interval: Interval,
    cancel: CancellationToken,
    ticks: u64,
}

impl PollScheduler {
    pub fn new(period: Duration, cancel: CancellationToken) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            cancel,
            ticks: 0,
        }
    }

    /// Wait for the next tick. `None` once cancelled.
    pub async fn tick(&mut self) -> Option<u64> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            _ = self.interval.tick() => {
                self.ticks += 1;
                Some(self.ticks)
            }
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// True on every `every`-th tick.
    pub fn is_nth(&self, every: u32) -> bool {
        every > 0 && self.ticks > 0 && self.ticks % every as u64 == 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_count_and_nth() {
        let mut scheduler = PollScheduler::new(Duration::from_millis(50), CancellationToken::new());
        for expected in 1..=10 {
            assert_eq!(scheduler.tick().await, Some(expected));
        }
        assert!(scheduler.is_nth(10));
        assert!(scheduler.is_nth(5));
        assert!(!scheduler.is_nth(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticking() {
        let cancel = CancellationToken::new();
        let mut scheduler = PollScheduler::new(Duration::from_millis(50), cancel.clone());
        assert_eq!(scheduler.tick().await, Some(1));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        assert_eq!(scheduler.tick().await, None);
        assert!(scheduler.is_cancelled());
        assert_eq!(scheduler.ticks(), 1);
    }
}
