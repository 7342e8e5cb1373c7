//! Request admission gate driven by server rate-limit headers.
//!
//! The limiter starts from a static requests-per-hour ceiling (or runs
//! unrestricted) and switches to the server's numbers as soon as a response
//! carries them. Admission does two things:
//!
//! ```text
//! remaining == 0  --> wait for reset_at, refill to limit
//! otherwise       --> remaining -= 1, then pace by window / limit
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::error::AppError;

const HOUR: Duration = Duration::from_secs(3600);

/// Names of the headers carrying rate-limit information.
///
/// Each field lists candidate names, checked in order. Lookups are
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: Vec<String>,
    pub remaining: Vec<String>,
    pub reset: Vec<String>,
    /// Quota window the server's limit applies to.
    pub window: Duration,
}

impl RateLimitHeaders {
    /// `X-RateLimit-*`, hourly quota, reset as epoch seconds.
    pub fn github() -> Self {
        Self {
            limit: vec!["x-ratelimit-limit".into()],
            remaining: vec!["x-ratelimit-remaining".into()],
            reset: vec!["x-ratelimit-reset".into()],
            window: HOUR,
        }
    }

    /// `RateLimit-*`, per-minute quota, reset as epoch seconds or an HTTP date.
    pub fn gitlab() -> Self {
        Self {
            limit: vec!["ratelimit-limit".into()],
            remaining: vec!["ratelimit-remaining".into()],
            reset: vec!["ratelimit-reset".into(), "ratelimit-resettime".into()],
            window: Duration::from_secs(60),
        }
    }
}

impl Default for RateLimitHeaders {
    /// Accepts both GitLab and GitHub header names with an hourly window.
    fn default() -> Self {
        let gitlab = Self::gitlab();
        let github = Self::github();
        Self {
            limit: [gitlab.limit, github.limit].concat(),
            remaining: [gitlab.remaining, github.remaining].concat(),
            reset: [gitlab.reset, github.reset].concat(),
            window: HOUR,
        }
    }
}

/// Snapshot of the quota currently enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitState {
    pub limit: u32,
    pub remaining: u32,
    pub window: Duration,
    pub reset_at: Instant,
}

impl RateLimitState {
    fn fresh(limit: u32, window: Duration, now: Instant) -> Self {
        Self {
            limit,
            remaining: limit,
            window,
            reset_at: now + window,
        }
    }

    /// Refill the quota once the reset time has passed.
    fn roll(&mut self, now: Instant) {
        if now < self.reset_at {
            return;
        }
        self.remaining = self.limit;
        if self.window.is_zero() {
            self.reset_at = now;
            return;
        }
        while self.reset_at <= now {
            self.reset_at += self.window;
        }
    }
}

#[derive(Debug)]
struct RateLimiterInner {
    state: Option<RateLimitState>,
    interval: Duration,
    next_slot: Option<Instant>,
}

/// Thread-safe admission gate shared by all workers of a client.
#[derive(Clone)]
pub struct RateLimiter {
    headers: RateLimitHeaders,
    inner: Arc<Mutex<RateLimiterInner>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("state", &self.state())
            .field("interval", &self.interval())
            .finish()
    }
}

impl RateLimiter {
    /// Build a limiter with an optional static ceiling.
    ///
    /// With no ceiling the limiter admits everything until a response
    /// carries rate-limit headers.
    pub fn new(headers: RateLimitHeaders, requests_per_hour: Option<u32>) -> Self {
        let now = Instant::now();
        let state = requests_per_hour
            .filter(|n| *n > 0)
            .map(|n| RateLimitState::fresh(n, HOUR, now));
        let interval = state.map(|s| s.window / s.limit).unwrap_or_default();
        Self {
            headers,
            inner: Arc::new(Mutex::new(RateLimiterInner {
                state,
                interval,
                next_slot: None,
            })),
        }
    }

    pub fn unrestricted() -> Self {
        Self::new(RateLimitHeaders::default(), None)
    }

    pub fn per_hour(requests: u32) -> Self {
        Self::new(RateLimitHeaders::default(), Some(requests))
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, RateLimiterInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limiter mutex");
            poisoned.into_inner()
        })
    }

    /// Current quota, with any due reset applied.
    pub fn state(&self) -> Option<RateLimitState> {
        let mut inner = self.lock_inner();
        let now = Instant::now();
        if let Some(state) = inner.state.as_mut() {
            state.roll(now);
        }
        inner.state
    }

    /// Delay enforced between two admitted requests.
    pub fn interval(&self) -> Duration {
        self.lock_inner().interval
    }

    /// Wait until the next request may be sent.
    pub async fn admit(&self) {
        loop {
            let deadline = {
                let mut inner = self.lock_inner();
                let now = Instant::now();
                let interval = inner.interval;
                let Some(state) = inner.state.as_mut() else {
                    return;
                };
                state.roll(now);
                if state.remaining == 0 {
                    // Exhausted: wait for the window to roll, then retry.
                    Err(state.reset_at)
                } else {
                    state.remaining -= 1;
                    let slot = inner.next_slot.map_or(now, |next| next.max(now));
                    inner.next_slot = Some(slot + interval);
                    Ok(slot)
                }
            };

            match deadline {
                Ok(slot) => {
                    tokio::time::sleep_until(slot).await;
                    return;
                }
                Err(reset_at) => {
                    tracing::debug!(
                        wait_ms = %reset_at.saturating_duration_since(Instant::now()).as_millis(),
                        "Rate limit exhausted, waiting for reset"
                    );
                    tokio::time::sleep_until(reset_at).await;
                }
            }
        }
    }

    /// Update the quota from response headers (names lowercase).
    ///
    /// Responses without rate-limit headers leave the current quota
    /// untouched. Unparseable values are an error; the quota is left as it
    /// was in that case.
    pub fn record_response(&self, headers: &HashMap<String, String>) -> Result<(), AppError> {
        let limit = find(headers, &self.headers.limit)
            .map(|(name, v)| parse_count(name, v))
            .transpose()?;
        let remaining = find(headers, &self.headers.remaining)
            .map(|(name, v)| parse_count(name, v))
            .transpose()?;
        let reset_in = find(headers, &self.headers.reset)
            .map(|(name, v)| parse_reset(name, v, Utc::now()))
            .transpose()?;

        if limit.is_none() && remaining.is_none() {
            return Ok(());
        }

        let now = Instant::now();
        let window = self.headers.window;
        let mut inner = self.lock_inner();
        let previous = inner.state;

        let limit = limit
            .or(previous.map(|s| s.limit))
            .or(remaining)
            .unwrap_or_default();
        if limit == 0 {
            return Err(AppError::InvalidInput(
                "Rate limit header reported a limit of 0".into(),
            ));
        }

        let mut state = match previous {
            Some(mut s) if s.limit == limit => {
                s.roll(now);
                s
            }
            _ => {
                let state = RateLimitState::fresh(limit, window, now);
                inner.interval = state.window / limit;
                tracing::info!(
                    limit,
                    interval_ms = %inner.interval.as_millis(),
                    "Adopted rate limit from response headers"
                );
                state
            }
        };
        if let Some(remaining) = remaining {
            state.remaining = remaining.min(limit);
        }
        if let Some(delta) = reset_in {
            state.reset_at = now + delta;
        }
        inner.state = Some(state);
        Ok(())
    }
}

fn find<'a>(headers: &'a HashMap<String, String>, names: &'a [String]) -> Option<(&'a str, &'a str)> {
    names.iter().find_map(|name| {
        headers
            .get(&name.to_ascii_lowercase())
            .map(|v| (name.as_str(), v.trim()))
    })
}

fn parse_count(name: &str, value: &str) -> Result<u32, AppError> {
    value
        .parse::<u32>()
        .map_err(|_| AppError::InvalidInput(format!("Header {name} is not a count: '{value}'")))
}

/// Time until reset. Accepts epoch seconds, delta seconds or an HTTP date.
fn parse_reset(name: &str, value: &str, now: DateTime<Utc>) -> Result<Duration, AppError> {
    let reset_at = match value.parse::<i64>() {
        Ok(n) if n > 1_000_000_000 => DateTime::from_timestamp(n, 0),
        Ok(n) => return Ok(Duration::from_secs(n.max(0).unsigned_abs())),
        Err(_) => DateTime::parse_from_rfc2822(value)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
    };
    let reset_at = reset_at.ok_or_else(|| {
        AppError::InvalidInput(format!("Header {name} is not a reset time: '{value}'"))
    })?;

    Ok((reset_at - now).to_std().unwrap_or_default())
}
