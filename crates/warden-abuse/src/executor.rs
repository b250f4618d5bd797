//! Retrying executor for platform-level actions.

use rand::Rng;
use std::time::Duration;
use warden_types::policy::RetryConfig;
use warden_types::{ActionError, ActionRequest, ActionSink};

/// Executes an action with bounded exponential backoff.
///
/// Retryable failures back off exponentially (with jitter, so scaled
/// instances retrying the same action don't synchronise); fatal failures
/// return immediately. When the attempt budget is exhausted the last error
/// is returned and the caller escalates it to an operator-visible alarm.
///
/// The sink contract is idempotent and retry-safe, so re-calling `execute`
/// after an ambiguous failure is always sound.
pub async fn execute_with_retry(
    sink: &dyn ActionSink,
    request: &ActionRequest,
    retry: &RetryConfig,
) -> Result<(), ActionError> {
    let attempts = retry.max_attempts.max(1);

    for attempt in 1..=attempts {
        match sink.execute(request).await {
            Ok(()) => return Ok(()),
            Err(ActionError::Fatal(detail)) => {
                return Err(ActionError::Fatal(detail));
            }
            Err(ActionError::Retryable(detail)) => {
                if attempt == attempts {
                    return Err(ActionError::Retryable(detail));
                }
                let delay = backoff_delay(retry, attempt);
                tracing::warn!(
                    action = request.action.as_str(),
                    tenant_id = %request.tenant_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "action execution failed, retrying: {}",
                    detail
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    unreachable!("loop returns on the final attempt")
}

/// Exponential delay for the given attempt with ±50% jitter, capped at
/// `max_delay_ms`.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exp = retry
        .base_delay_ms
        .saturating_mul(1u64 << (attempt - 1).min(20));
    let capped = exp.min(retry.max_delay_ms).max(1);
    let jittered = rand::thread_rng().gen_range(capped / 2..=capped + capped / 2);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use warden_types::MitigationAction;

    /// Sink that fails `failures` times before succeeding.
    struct FlakySink {
        failures: u32,
        calls: Arc<AtomicU32>,
        fatal: bool,
    }

    #[async_trait::async_trait]
    impl ActionSink for FlakySink {
        async fn execute(&self, _request: &ActionRequest) -> Result<(), ActionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                if self.fatal {
                    Err(ActionError::Fatal("bad target".into()))
                } else {
                    Err(ActionError::Retryable("timeout".into()))
                }
            } else {
                Ok(())
            }
        }
    }

    fn mute_request() -> ActionRequest {
        ActionRequest {
            tenant_id: "t1".into(),
            subject_id: "-100".into(),
            actor_id: Some("u1".into()),
            action: MitigationAction::Mute,
            duration: Some(Duration::from_secs(300)),
            reverse: false,
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let sink = FlakySink {
            failures: 2,
            calls: calls.clone(),
            fatal: false,
        };

        execute_with_retry(&sink, &mute_request(), &fast_retry())
            .await
            .expect("should eventually succeed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_then_fails() {
        let calls = Arc::new(AtomicU32::new(0));
        let sink = FlakySink {
            failures: 10,
            calls: calls.clone(),
            fatal: false,
        };

        let err = execute_with_retry(&sink, &mute_request(), &fast_retry())
            .await
            .expect_err("budget should exhaust");
        assert!(matches!(err, ActionError::Retryable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 4, "one call per attempt");
    }

    #[tokio::test]
    async fn fatal_failure_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let sink = FlakySink {
            failures: 10,
            calls: calls.clone(),
            fatal: true,
        };

        let err = execute_with_retry(&sink, &mute_request(), &fast_retry())
            .await
            .expect_err("fatal should not retry");
        assert!(matches!(err, ActionError::Fatal(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
