//! Rate-governed remote calls with bounded retry.

use std::future::Future;
use std::time::Duration;

use grouplog_client::{ApiError, MessagingApi};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::config::Settings;
use crate::governor::{Channel, RateGovernor};
use crate::progress::Coordinator;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub transient_retries: u32,
    pub backoff: Duration,
    pub max_throttle_waits: u32,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            transient_retries: settings.transient_retries,
            backoff: Duration::try_from_secs_f64(settings.transient_backoff_secs.max(0.0))
                .unwrap_or(Duration::ZERO),
            max_throttle_waits: settings.max_throttle_waits,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Debug, Error)]
pub enum CallFailure {
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The run was cancelled (or ran out of budget) before the call went out.
    #[error("stopped before the call was issued")]
    Stopped,
}

/// Issue `call` on `channel`, pacing it through the governor.
///
/// Throttle directives are waited out and retried (up to
/// `max_throttle_waits`), transient failures are retried after a fixed
/// backoff. Every other error is returned as is. No attempt is started
/// once the coordinator says to stop.
pub async fn governed<T, F, Fut>(
    governor: &RateGovernor,
    channel: Channel,
    policy: &RetryPolicy,
    coordinator: &Coordinator,
    mut call: F,
) -> Result<T, CallFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut throttles = 0;
    let mut retries = 0;

    loop {
        if coordinator.should_stop() {
            return Err(CallFailure::Stopped);
        }
        governor.before_call(channel).await;

        match call().await {
            Ok(value) => return Ok(value),
            Err(ApiError::Throttled { seconds }) => {
                if throttles >= policy.max_throttle_waits {
                    warn!(?channel, throttles, "giving up after repeated throttling");
                    return Err(ApiError::Throttled { seconds }.into());
                }
                throttles += 1;
                governor.on_provider_throttle(channel, seconds).await;
            }
            Err(e) if e.is_transient() && retries < policy.transient_retries => {
                retries += 1;
                warn!(?channel, attempt = retries, "transient failure, retrying: {}", e);
                sleep(policy.backoff).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Everything a stage needs to issue governed calls for one run.
#[derive(Clone, Copy)]
pub struct Remote<'a> {
    pub api: &'a dyn MessagingApi,
    pub governor: &'a RateGovernor,
    pub policy: &'a RetryPolicy,
    pub coordinator: &'a Coordinator,
}

impl<'a> Remote<'a> {
    pub async fn call<T, F, Fut>(&self, channel: Channel, call: F) -> Result<T, CallFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        governed(self.governor, channel, self.policy, self.coordinator, call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            transient_retries: 2,
            backoff: Duration::from_secs(2),
            max_throttle_waits: 1,
        }
    }

    fn governor() -> RateGovernor {
        RateGovernor::with_delays([(Channel::Primary, Duration::from_secs(5))])
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_then_succeeds() {
        let governor = governor();
        let coordinator = Coordinator::new(CancellationToken::new());
        let script = Mutex::new(vec![
            Ok(7),
            Err(ApiError::Transient("reset".into())),
            Err(ApiError::Transient("reset".into())),
        ]);
        let start = Instant::now();

        let value = governed(&governor, Channel::Primary, &policy(), &coordinator, || {
            let next = script.lock().unwrap().pop().unwrap();
            async move { next }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        // Backoff (2s) then the rest of the 5s spacing, twice.
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_are_bounded() {
        let governor = RateGovernor::with_delays([]);
        let coordinator = Coordinator::new(CancellationToken::new());
        let mut attempts = 0;

        let result: Result<(), _> = governed(&governor, Channel::Primary, &policy(), &coordinator, || {
            attempts += 1;
            async { Err(ApiError::Transient("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(CallFailure::Api(ApiError::Transient(_)))));
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_is_waited_out() {
        let governor = governor();
        let coordinator = Coordinator::new(CancellationToken::new());
        let script = Mutex::new(vec![Ok(1), Err(ApiError::Throttled { seconds: 30 })]);
        let start = Instant::now();

        let value = governed(&governor, Channel::Primary, &policy(), &coordinator, || {
            let next = script.lock().unwrap().pop().unwrap();
            async move { next }
        })
        .await
        .unwrap();
        assert_eq!(value, 1);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_errors_are_not_retried() {
        let governor = governor();
        let coordinator = Coordinator::new(CancellationToken::new());
        let mut attempts = 0;

        let result: Result<(), _> = governed(&governor, Channel::Primary, &policy(), &coordinator, || {
            attempts += 1;
            async { Err(ApiError::Access("CHANNEL_PRIVATE".into())) }
        })
        .await;
        assert!(matches!(result, Err(CallFailure::Api(ApiError::Access(_)))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_no_call_after_cancellation() {
        let governor = governor();
        let token = CancellationToken::new();
        token.cancel();
        let coordinator = Coordinator::new(token);
        let mut attempts = 0;

        let result: Result<(), _> = governed(&governor, Channel::Primary, &policy(), &coordinator, || {
            attempts += 1;
            async { Ok(()) }
        })
        .await;
        assert!(matches!(result, Err(CallFailure::Stopped)));
        assert_eq!(attempts, 0);
    }
}
