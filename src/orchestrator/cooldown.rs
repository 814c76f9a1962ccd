use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A model is skipped until `until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cooldown {
    pub until: DateTime<Utc>,
}

impl Cooldown {
    pub fn start(now: DateTime<Utc>, base: Duration) -> Self {
        Self { until: now + base }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.until > now
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        if self.is_active(now) {
            self.until - now
        } else {
            Duration::zero()
        }
    }

    /// Another failure: double what is left (capped), or start over from
    /// `base` if the previous cooldown already ran out.
    pub fn extend(&self, now: DateTime<Utc>, base: Duration, cap: Duration) -> Self {
        if !self.is_active(now) {
            return Self::start(now, base);
        }
        let doubled = self.remaining(now) * 2;
        Self {
            until: now + doubled.min(cap),
        }
    }
}
