use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Max retry attempts for transient errors.
pub(crate) const MAX_RETRIES: u32 = 3;

pub(crate) fn is_retryable(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503)
}

/// Backoff before retry `attempt` (0-based): 1s, 2s, 4s plus up to 500ms jitter.
pub(crate) fn backoff_ms(attempt: u32) -> u64 {
    let base_ms = 1000u64 * 2u64.pow(attempt);
    // Simple jitter without rand crate
    let jitter_ms = u64::from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos()
            % 500,
    );
    base_ms + jitter_ms
}

/// Send a request with retry on transient errors (429, 500, 502, 503).
///
/// `build` is called once per attempt because multipart bodies cannot be
/// cloned.
pub(crate) async fn send_with_retry<F>(service: &str, build: F) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=MAX_RETRIES {
        let response = build()
            .send()
            .await
            .with_context(|| format!("failed to send request to {service}"))?;

        let status = response.status();
        debug!(service, status = %status, attempt = attempt + 1, "http response");

        if status.is_success() {
            return Ok(response);
        }

        if !is_retryable(status) || attempt == MAX_RETRIES {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("{service} API error: {status} - {error_text}");
        }

        let error_text = response.text().await.unwrap_or_default();
        let backoff_ms = backoff_ms(attempt);
        warn!(
            service,
            attempt = attempt + 1,
            max = MAX_RETRIES,
            status = %status,
            backoff_ms,
            "retryable {service} error, backing off: {error_text}"
        );

        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;

        last_err = Some(format!("{status} - {error_text}"));
    }

    anyhow::bail!(
        "{service} API error after retries: {}",
        last_err.unwrap_or_default()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn only_overload_and_server_errors_are_retried() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn backoff_grows_exponentially() {
        assert!((1000..1500).contains(&backoff_ms(0)));
        assert!((2000..2500).contains(&backoff_ms(1)));
        assert!((4000..4500).contains(&backoff_ms(2)));
    }
}
