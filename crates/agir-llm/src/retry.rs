use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use agir_core::config::RetryConfig;
use agir_core::error::{AgirError, Result};
use agir_core::traits::LlmProvider;
use agir_core::types::GenerationRequest;

/// A provider that applies a per-attempt timeout and retries transient failures.
///
/// The engine never retries on its own; this wrapper is the caller-side policy.
pub struct RetryingProvider {
    inner: Arc<dyn LlmProvider>,
    retry_config: RetryConfig,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }

    async fn attempt(&self, request: GenerationRequest) -> Result<String> {
        match self.retry_config.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), self.inner.generate(request))
                .await
                .map_err(|_| AgirError::Timeout { secs })?,
            None => self.inner.generate(request).await,
        }
    }
}

fn is_retryable(e: &AgirError) -> bool {
    match e {
        AgirError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        AgirError::LlmStream(_) | AgirError::Timeout { .. } => true,
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl LlmProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut attempt = 0;
            loop {
                match self.attempt(request.clone()).await {
                    Ok(text) => return Ok(text),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            provider = %self.inner.name(),
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying LLM request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agir_core::types::GenerationParams;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with the given error `failures` times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: fn() -> AgirError,
    }

    impl LlmProvider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn generate(&self, _request: GenerationRequest) -> BoxFuture<'_, Result<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if n < self.failures {
                Err((self.error)())
            } else {
                Ok("ok".to_string())
            };
            Box::pin(async move { result })
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            timeout_secs: None,
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("hi", GenerationParams::default())
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let inner = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            error: || AgirError::LlmRequest("HTTP 503: busy".into()),
        });
        let provider = RetryingProvider::new(inner.clone(), fast_retry(3));
        assert_eq!(provider.generate(request()).await.unwrap(), "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_by_default() {
        let inner = Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
            error: || AgirError::LlmRequest("HTTP 503: busy".into()),
        });
        let provider = RetryingProvider::new(inner.clone(), RetryConfig::default());
        assert!(provider.generate(request()).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let inner = Arc::new(Flaky {
            failures: 5,
            calls: AtomicU32::new(0),
            error: || AgirError::LlmRequest("HTTP 401: bad key".into()),
        });
        let provider = RetryingProvider::new(inner.clone(), fast_retry(3));
        assert!(provider.generate(request()).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    struct Slow;

    impl LlmProvider for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn generate(&self, _request: GenerationRequest) -> BoxFuture<'_, Result<String>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("late".to_string())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let config = RetryConfig {
            timeout_secs: Some(1),
            ..RetryConfig::default()
        };
        let provider = RetryingProvider::new(Arc::new(Slow), config);
        let err = provider.generate(request()).await.unwrap_err();
        assert!(matches!(err, AgirError::Timeout { secs: 1 }));
    }
}
