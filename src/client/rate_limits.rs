//! Rate Limit Headers
//!
//! Parses provider rate-limit and retry-after headers into [`RateLimitData`].

use crate::config::RateLimitHeaders;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rate limit snapshot reported by a provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitData {
    /// Requests allowed in the current window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_limit: Option<u64>,

    /// Requests left in the current window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_remaining: Option<u64>,

    /// Tokens allowed in the current window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_limit: Option<u64>,

    /// Tokens left in the current window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_remaining: Option<u64>,

    /// When the window resets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,

    /// Account tier, when the provider reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,

    /// When the snapshot was read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

impl RateLimitData {
    /// True when the provider reported nothing usable
    pub fn is_empty(&self) -> bool {
        self.requests_limit.is_none()
            && self.requests_remaining.is_none()
            && self.tokens_limit.is_none()
            && self.tokens_remaining.is_none()
            && self.reset_at.is_none()
            && self.tier.is_none()
    }

    /// Build a snapshot from response headers using the provider's header names
    pub fn from_headers(headers: &HeaderMap, names: &RateLimitHeaders, now: DateTime<Utc>) -> Self {
        let reset_at = header_str(headers, &names.reset_requests)
            .or_else(|| header_str(headers, &names.reset_tokens))
            .and_then(|value| parse_reset(value, now));

        Self {
            requests_limit: header_u64(headers, &names.limit_requests),
            requests_remaining: header_u64(headers, &names.remaining_requests),
            tokens_limit: header_u64(headers, &names.limit_tokens),
            tokens_remaining: header_u64(headers, &names.remaining_tokens),
            reset_at,
            tier: names
                .tier
                .as_deref()
                .and_then(|name| header_str(headers, name))
                .map(str::to_string),
            captured_at: Some(now),
        }
    }
}

/// Parse a retry-after hint from response headers.
///
/// `retry-after-ms` wins over `retry-after`; a custom header name replaces the latter.
pub fn parse_retry_after(headers: &HeaderMap, retry_after_header: Option<&str>) -> Option<Duration> {
    if let Some(ms) = header_str(headers, "retry-after-ms").and_then(|v| v.trim().parse::<f64>().ok()) {
        if ms >= 0.0 {
            return Some(Duration::from_millis(ms.round() as u64));
        }
    }

    let key = retry_after_header.unwrap_or("retry-after");
    let value = header_str(headers, key)?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>() {
        if secs >= 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
    }
    if let Some(duration) = parse_duration_string(value) {
        return Some(duration);
    }

    // HTTP-date form
    DateTime::parse_from_rfc2822(value)
        .ok()
        .and_then(|at| (at.with_timezone(&Utc) - Utc::now()).to_std().ok())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|s| s.trim().parse::<u64>().ok())
}

/// Reset values come as seconds, duration strings ("6m0s") or RFC 3339 timestamps
fn parse_reset(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }

    let duration = value
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
        .or_else(|| parse_duration_string(value))?;

    chrono::Duration::from_std(duration).ok().map(|d| now + d)
}

/// Parse a duration string like "1m30s" or "2h" into a Duration
pub(crate) fn parse_duration_string(s: &str) -> Option<Duration> {
    let s = s.trim();

    if let Some(stripped) = s.strip_suffix("ms") {
        return stripped.parse::<f64>().ok().map(|ms| Duration::from_secs_f64(ms / 1000.0));
    }

    // Compound forms: "1m30s", "2h30m", "6m0.5s"
    if s.contains('h') || (s.contains('m') && s.contains('s')) {
        let mut total = 0f64;
        let mut current = String::new();

        for c in s.chars() {
            if c.is_ascii_digit() || c == '.' {
                current.push(c);
            } else if !current.is_empty() {
                if let Ok(n) = current.parse::<f64>() {
                    match c {
                        'h' => total += n * 3600.0,
                        'm' => total += n * 60.0,
                        's' => total += n,
                        _ => {}
                    }
                }
                current.clear();
            }
        }

        if total > 0.0 {
            return Some(Duration::from_secs_f64(total));
        }
    }

    if let Some(stripped) = s.strip_suffix('s') {
        return stripped.parse::<f64>().ok().map(Duration::from_secs_f64);
    }
    if let Some(stripped) = s.strip_suffix('m') {
        return stripped.parse::<u64>().ok().map(|mins| Duration::from_secs(mins * 60));
    }
    if let Some(stripped) = s.strip_suffix('h') {
        return stripped.parse::<u64>().ok().map(|hours| Duration::from_secs(hours * 3600));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn test_parse_duration_string() {
        assert_eq!(parse_duration_string("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration_string("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration_string("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration_string("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration_string("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration_string("6m0s"), Some(Duration::from_secs(360)));
        assert_eq!(parse_duration_string("soon"), None);
    }

    #[test]
    fn test_openai_style_headers() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let map = headers(&[
            ("x-ratelimit-limit-requests", "500"),
            ("x-ratelimit-remaining-requests", "499"),
            ("x-ratelimit-limit-tokens", "30000"),
            ("x-ratelimit-remaining-tokens", "29000"),
            ("x-ratelimit-reset-requests", "1m30s"),
        ]);

        let data = RateLimitData::from_headers(&map, &RateLimitHeaders::default(), now);
        assert_eq!(data.requests_limit, Some(500));
        assert_eq!(data.requests_remaining, Some(499));
        assert_eq!(data.tokens_limit, Some(30000));
        assert_eq!(data.tokens_remaining, Some(29000));
        assert_eq!(data.reset_at, Some(now + chrono::Duration::seconds(90)));
    }

    #[test]
    fn test_rfc3339_reset() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let map = headers(&[("x-ratelimit-reset-requests", "2026-01-01T00:05:00Z")]);

        let data = RateLimitData::from_headers(&map, &RateLimitHeaders::default(), now);
        assert_eq!(data.reset_at, Some(now + chrono::Duration::minutes(5)));
    }

    #[test]
    fn test_empty_headers() {
        let data = RateLimitData::from_headers(&HeaderMap::new(), &RateLimitHeaders::default(), Utc::now());
        assert!(data.is_empty());
    }

    #[test]
    fn test_retry_after() {
        assert_eq!(
            parse_retry_after(&headers(&[("retry-after", "5")]), None),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            parse_retry_after(&headers(&[("retry-after", "5"), ("retry-after-ms", "1500")]), None),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            parse_retry_after(&headers(&[("x-wait", "2m")]), Some("x-wait")),
            Some(Duration::from_secs(120))
        );
        assert_eq!(parse_retry_after(&HeaderMap::new(), None), None);
    }
}
