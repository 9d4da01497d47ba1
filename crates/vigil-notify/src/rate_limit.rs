use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

fn default_per_minute() -> u32 {
    60
}

fn default_per_hour() -> u32 {
    1_000
}

fn default_burst() -> u32 {
    10
}

/// Rolling request budget for one channel. A limit of 0 disables that window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_minute")]
    pub max_requests_per_minute: u32,
    #[serde(default = "default_per_hour")]
    pub max_requests_per_hour: u32,
    /// Extra requests tolerated on top of the per-minute budget.
    #[serde(default = "default_burst")]
    pub burst_allowance: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: default_per_minute(),
            max_requests_per_hour: default_per_hour(),
            burst_allowance: default_burst(),
        }
    }
}

impl RateLimitConfig {
    pub fn unlimited() -> Self {
        Self {
            max_requests_per_minute: 0,
            max_requests_per_hour: 0,
            burst_allowance: 0,
        }
    }
}

/// Sliding-window limiter over the last hour of granted requests.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    granted: VecDeque<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            granted: VecDeque::new(),
        }
    }

    /// Records a request at `now` if both windows have room.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_unlimited() {
            return true;
        }
        let hour_ago = now - Duration::hours(1);
        while self.granted.front().is_some_and(|t| *t <= hour_ago) {
            self.granted.pop_front();
        }

        let per_hour = self.config.max_requests_per_hour;
        if per_hour > 0 && self.granted.len() >= per_hour as usize {
            return false;
        }

        let per_minute = self.config.max_requests_per_minute;
        if per_minute > 0 {
            let minute_ago = now - Duration::minutes(1);
            let last_minute = self.granted.iter().rev().take_while(|t| **t > minute_ago).count();
            let budget = per_minute as usize + self.config.burst_allowance as usize;
            if last_minute >= budget {
                return false;
            }
        }

        self.granted.push_back(now);
        true
    }

    fn is_unlimited(&self) -> bool {
        self.config.max_requests_per_minute == 0 && self.config.max_requests_per_hour == 0
    }

    pub fn in_flight_last_hour(&self) -> usize {
        self.granted.len()
    }
}
