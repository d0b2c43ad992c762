//! Rate limits for calling cloud recognition APIs.
//!
//! Limits are specified as `"N/s"` or `"N/m"`, and enforced by a
//! [`SlidingWindowLimiter`] which is shared by every worker calling the same
//! backend.

use std::{collections::VecDeque, fmt, str::FromStr, time::Duration};

use tokio::{
    sync::Mutex,
    time::{self, Instant},
};

use crate::prelude::*;

/// The period over which the rate limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    /// Per second.
    Second,
    /// Per minute.
    Minute,
}

impl RateLimitPeriod {
    /// Convert this period to a [`Duration`].
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A rate limit for an API.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    /// The maximum number of requests allowed in the period.
    pub max_requests: usize,
    /// The period over which the rate limit is applied.
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Create a new [`RateLimit`].
    pub fn new(max_requests: usize, per_period: RateLimitPeriod) -> Self {
        Self {
            max_requests,
            per_period,
        }
    }

    /// Create a [`SlidingWindowLimiter`] enforcing this rate limit.
    pub fn to_limiter(&self) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(self.max_requests, self.per_period.to_duration())
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(1800, RateLimitPeriod::Minute)
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let (max_requests, per_period) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("Missing period"))?;
            let max_requests = max_requests.parse::<usize>()?;
            if max_requests == 0 {
                bail!("Rate limit must allow at least one request");
            }
            Ok(Self {
                max_requests,
                per_period: per_period.parse::<RateLimitPeriod>()?,
            })
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}

/// A sliding-window request throttle.
///
/// Before each request we drop every recorded timestamp older than the window.
/// If the window is still full, we sleep until the oldest request leaves it.
/// The lock is held while sleeping, so waiting callers are admitted in order.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// Create a limiter allowing `max_requests` per `window`.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            max_requests,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    /// Wait until we're allowed to make another request, and record it.
    pub async fn acquire(&self) {
        let mut timestamps = self.timestamps.lock().await;
        loop {
            let now = Instant::now();
            while let Some(&oldest) = timestamps.front() {
                if now.duration_since(oldest) >= self.window {
                    timestamps.pop_front();
                } else {
                    break;
                }
            }
            if timestamps.len() < self.max_requests {
                break;
            }
            let Some(&oldest) = timestamps.front() else {
                break;
            };
            let wake_at = oldest + self.window;
            info!(
                wait_secs = wake_at.duration_since(now).as_secs_f64(),
                "Rate limit reached, waiting"
            );
            time::sleep_until(wake_at).await;
        }
        timestamps.push_back(Instant::now());
    }
}
