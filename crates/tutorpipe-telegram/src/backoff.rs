//! Retry with exponential backoff, honoring server-specified waits.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use tutorpipe_core::config::TelegramConfig;

use crate::types::SourceError;

/// Deterministic-enough jitter without a RNG dependency: the current
/// subsecond fraction, scaled.
fn jitter_fraction() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_millis() as f64 / 1000.0)
        .unwrap_or(0.5)
}

/// Delay before the next attempt, or `None` when the error is fatal.
pub fn retry_delay(cfg: &TelegramConfig, error: &SourceError, attempt: u32) -> Option<Duration> {
    if error.is_fatal() {
        return None;
    }
    let secs = match error.server_wait_seconds() {
        // Honor the server's wait plus a small jitter, capped.
        Some(wait) => {
            let wait = wait as f64;
            let jitter = (wait * 0.1).min(5.0) * (0.5 + jitter_fraction());
            (wait + jitter).min(cfg.max_retry_delay_seconds.max(wait))
        }
        None => (cfg.initial_retry_delay_seconds * cfg.backoff_multiplier.powi(attempt as i32))
            .min(cfg.max_retry_delay_seconds),
    };
    Some(Duration::from_secs_f64(secs.max(0.0)))
}

/// Run `op` with bounded retries. Fatal errors and exhausted attempts
/// propagate the last error.
pub async fn retry_with_backoff<T, F, Fut>(cfg: &TelegramConfig, mut op: F) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= cfg.max_retries {
                    return Err(e);
                }
                let Some(delay) = retry_delay(cfg, &e, attempt) else {
                    return Err(e);
                };
                warn!(
                    error = %e,
                    attempt = attempt + 1,
                    max_retries = cfg.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "source call failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_cfg() -> TelegramConfig {
        TelegramConfig {
            max_retries: 3,
            initial_retry_delay_seconds: 0.001,
            max_retry_delay_seconds: 0.005,
            backoff_multiplier: 2.0,
            ..TelegramConfig::default()
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let cfg = fast_cfg();
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&cfg, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SourceError::Transient("boom".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let cfg = fast_cfg();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&cfg, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SourceError::Transient("always".into())) }
        })
        .await;
        assert!(result.is_err());
        // initial call + max_retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let cfg = fast_cfg();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&cfg, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SourceError::Unauthorized("no session".into())) }
        })
        .await;
        assert!(matches!(result, Err(SourceError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flood_wait_honors_server_hint() {
        let cfg = fast_cfg();
        let delay = retry_delay(&cfg, &SourceError::FloodWait { seconds: 10 }, 0).unwrap();
        // server wait dominates the configured cap
        assert!(delay.as_secs_f64() >= 10.0);
        assert!(delay.as_secs_f64() <= 16.0);
    }

    #[test]
    fn transient_backoff_is_capped() {
        let cfg = fast_cfg();
        let delay = retry_delay(&cfg, &SourceError::Transient("x".into()), 30).unwrap();
        assert!(delay.as_secs_f64() <= cfg.max_retry_delay_seconds + 1e-9);
    }
}
