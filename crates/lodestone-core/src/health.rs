use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Fallback liveness window when neither the heartbeat nor the policy gives a positive one.
pub const DEFAULT_TTL_SECS: i64 = 30;

pub const DEFAULT_CHECK_INTERVAL_SECS: i32 = 30;
pub const DEFAULT_CHECK_TIMES: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum CheckMode {
    Heartbeat,
    Push,
    Pull,
}

/// Health-check policy persisted with an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct HealthCheck {
    pub mode: CheckMode,
    /// Seconds between two heartbeats.
    pub interval: i32,
    /// Missed heartbeats tolerated before the instance is stale.
    pub times: i32,
}

impl HealthCheck {
    pub fn heartbeat(interval: i32, times: i32) -> Self {
        Self {
            mode: CheckMode::Heartbeat,
            interval,
            times,
        }
    }

    /// interval × (times + 1), or the default when that is not positive.
    pub fn effective_ttl_secs(&self) -> i64 {
        let ttl = i64::from(self.interval) * (i64::from(self.times) + 1);
        if ttl <= 0 { DEFAULT_TTL_SECS } else { ttl }
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::heartbeat(DEFAULT_CHECK_INTERVAL_SECS, DEFAULT_CHECK_TIMES)
    }
}
