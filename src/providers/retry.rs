use anyhow::{Context, Result, anyhow};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::api_error_message;

const RATE_LIMIT_MARKERS: [&str; 4] = ["rate limit", "rate_limit", "too many requests", "overloaded"];

/// How long to keep resending a request the API refused for load reasons.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RateLimit {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Sends the request produced by `build` and returns the body of the first
/// 2xx reply. Only rate-limit style refusals are resent; anything else fails
/// right away with the API's own error message.
pub(crate) async fn send_json<F>(label: &str, limit: RateLimit, build: F) -> Result<String>
where
    F: Fn() -> RequestBuilder,
{
    let mut delay = limit.base_delay;
    let mut attempt = 1;
    loop {
        let response = build()
            .send()
            .await
            .with_context(|| format!("failed to reach {}", label))?;
        let status = response.status();
        let hint = retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            debug!("{} answered on attempt {}", label, attempt);
            return Ok(body);
        }
        if attempt >= limit.max_attempts || !is_rate_limited(status, &body) {
            let detail = api_error_message(&body).unwrap_or(body);
            return Err(anyhow!("{} API error ({}): {}", label, status, detail));
        }
        let wait = hint.map_or(delay, |hint| hint.max(delay)).min(limit.max_delay);
        warn!(
            "{} rate limited; retrying in {:.1}s (attempt {}/{})",
            label,
            wait.as_secs_f32(),
            attempt,
            limit.max_attempts
        );
        sleep(wait).await;
        delay = next_delay(delay, limit.base_delay, limit.max_delay);
        attempt += 1;
    }
}

fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    match status.as_u16() {
        429 | 503 | 529 => true,
        _ => {
            let lower = body.to_lowercase();
            RATE_LIMIT_MARKERS.iter().any(|marker| lower.contains(marker))
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Doubles `current`, never below `base` and never above `cap`.
pub(crate) fn next_delay(current: Duration, base: Duration, cap: Duration) -> Duration {
    current.saturating_mul(2).max(base).min(cap)
}
