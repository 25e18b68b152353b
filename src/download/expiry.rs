//! Expiration time computation from response headers.

use chrono::{DateTime, Duration, Utc};
use http::header::{CACHE_CONTROL, EXPIRES};
use http::HeaderMap;

use crate::origin::parse_http_date;

pub const DEFAULT_EXPIRATION_DAYS: i64 = 28;
pub const MIN_EXPIRATION_DAYS: i64 = 7;
pub const MAX_EXPIRATION_DAYS: i64 = 365;

/// Bounds applied to server-provided freshness lifetimes.
///
/// `Cache-Control: max-age` takes precedence over `Expires`. Without either
/// header the default lifetime is used. The result is always clamped to
/// `[now + min, now + max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationPolicy {
    pub default: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self {
            default: Duration::days(DEFAULT_EXPIRATION_DAYS),
            min: Duration::days(MIN_EXPIRATION_DAYS),
            max: Duration::days(MAX_EXPIRATION_DAYS),
        }
    }
}

impl ExpirationPolicy {
    pub fn new(default: Duration, min: Duration, max: Duration) -> Result<Self, String> {
        if min < Duration::zero() {
            return Err("minimum expiration must not be negative".to_string());
        }
        if min > max {
            return Err(format!(
                "minimum expiration ({}s) exceeds maximum ({}s)",
                min.num_seconds(),
                max.num_seconds()
            ));
        }
        Ok(Self { default, min, max })
    }

    /// Expiration time for a response received at `now`.
    pub fn compute(&self, headers: &HeaderMap, now: DateTime<Utc>) -> DateTime<Utc> {
        let expires = max_age(headers)
            .map(|age| now + age)
            .or_else(|| {
                headers
                    .get(EXPIRES)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_http_date)
            })
            .unwrap_or(now + self.default);

        expires.max(now + self.min).min(now + self.max)
    }
}

/// `max-age` from `Cache-Control`; `no-cache` and `no-store` count as zero.
fn max_age(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(CACHE_CONTROL)?.to_str().ok()?;
    for directive in value.split(',').map(str::trim) {
        let lower = directive.to_ascii_lowercase();
        if lower == "no-cache" || lower == "no-store" {
            return Some(Duration::zero());
        }
        if let Some(seconds) = lower.strip_prefix("max-age=") {
            if let Ok(seconds) = seconds.trim_matches('"').parse::<i64>() {
                return Some(Duration::seconds(seconds.max(0)));
            }
        }
    }
    None
}
