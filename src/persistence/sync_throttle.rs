use crate::reading::SensorReading;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Persist every decoded reading
    Unconditional,
    /// Persist at most one reading per interval
    RateLimited,
}

/// Decides which live readings are written to the repository.
///
/// Only the time of the last forward is tracked. It is not rolled back when
/// the write itself fails, so a failing backend sees at most one attempt per
/// interval.
#[derive(Debug, Clone)]
pub struct SyncThrottle {
    policy: SyncPolicy,
    interval: Duration,
    last_forward: Option<DateTime<Utc>>,
}

impl SyncThrottle {
    pub fn new(policy: SyncPolicy, interval: Duration) -> Self {
        Self {
            policy,
            interval,
            last_forward: None,
        }
    }

    pub fn unconditional() -> Self {
        Self::new(SyncPolicy::Unconditional, Duration::ZERO)
    }

    pub fn rate_limited(interval: Duration) -> Self {
        Self::new(SyncPolicy::RateLimited, interval)
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn last_forward(&self) -> Option<DateTime<Utc>> {
        self.last_forward
    }

    pub fn maybe_forward(&mut self, _reading: &SensorReading, now: DateTime<Utc>) -> bool {
        let forward = match (self.policy, self.last_forward) {
            (SyncPolicy::Unconditional, _) | (SyncPolicy::RateLimited, None) => true,
            (SyncPolicy::RateLimited, Some(last)) => match (now - last).to_std() {
                Ok(elapsed) => elapsed >= self.interval,
                // Clock stepped backwards; wait for it to pass the marker again.
                Err(_) => false,
            },
        };
        if forward {
            self.last_forward = Some(now);
        }
        forward
    }
}

impl Default for SyncThrottle {
    fn default() -> Self {
        Self::rate_limited(DEFAULT_SYNC_INTERVAL)
    }
}
