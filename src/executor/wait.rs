// Polling helper with a deadline and a growing tick

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::output::errors::TestbedError;

/// Default pause between two checks, in seconds
pub const DEFAULT_TICK: f64 = 30.0;

/// Default multiplier applied to the tick after each incomplete check
pub const DEFAULT_TICK_INCREASE: f64 = 1.0;

/// Poll `check` until it succeeds or the deadline passes
///
/// The check signals "not yet" by returning [`TestbedError::WaitingIncomplete`];
/// any other error is propagated immediately. The deadline is computed once
/// and is tested both before each attempt and after a successful one, so a
/// check that succeeds too late still fails with `check_success` set.
pub async fn wait<T, F, Fut>(
    name: &str,
    mut check: F,
    timeout: Duration,
    tick: f64,
    tick_increase: f64,
) -> Result<T, TestbedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TestbedError>>,
{
    if !tick.is_finite() || tick <= 0.0 {
        return Err(TestbedError::general("Tick must be a positive integer"));
    }
    if !tick_increase.is_finite() || tick_increase <= 0.0 {
        return Err(TestbedError::general("Tick increase must be a positive number"));
    }

    let deadline = Instant::now() + timeout;
    let mut tick = tick;

    debug!(check = name, ?timeout, tick, tick_increase, "waiting for condition");

    loop {
        if Instant::now() > deadline {
            return Err(TestbedError::WaitingTimedOut {
                check: name.to_string(),
                timeout,
                check_success: false,
            });
        }

        match check().await {
            Ok(value) => {
                if Instant::now() > deadline {
                    return Err(TestbedError::WaitingTimedOut {
                        check: name.to_string(),
                        timeout,
                        check_success: true,
                    });
                }
                debug!(check = name, "condition satisfied");
                return Ok(value);
            }
            Err(TestbedError::WaitingIncomplete) => {
                debug!(check = name, tick, "condition not satisfied yet");
                let pause = Duration::try_from_secs_f64(tick).map_err(|e| {
                    TestbedError::general(format!("Invalid tick {} of '{}': {}", tick, name, e))
                })?;
                tokio::time::sleep(pause).await;
                tick *= tick_increase;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_succeeds_after_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let value = wait(
            "third time lucky",
            || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestbedError::WaitingIncomplete)
                    } else {
                        Ok(42)
                    }
                }
            },
            Duration::from_secs(5),
            0.01,
            1.0,
        )
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let err = wait(
            "never",
            || async { Err::<(), _>(TestbedError::WaitingIncomplete) },
            Duration::from_millis(50),
            0.01,
            1.0,
        )
        .await
        .unwrap_err();

        match err {
            TestbedError::WaitingTimedOut { check_success, .. } => assert!(!check_success),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_late_success_is_timeout() {
        let err = wait(
            "slow",
            || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            },
            Duration::from_millis(10),
            0.01,
            1.0,
        )
        .await
        .unwrap_err();

        match err {
            TestbedError::WaitingTimedOut { check_success, .. } => assert!(check_success),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_rejects_bad_tick() {
        let err = wait("x", || async { Ok(()) }, Duration::from_secs(1), 0.0, 1.0)
            .await
            .unwrap_err();

        assert!(err.message().contains("Tick must be a positive integer"));

        let err = wait("x", || async { Ok(()) }, Duration::from_secs(1), f64::NAN, 1.0)
            .await
            .unwrap_err();
        assert!(err.message().contains("Tick must be a positive integer"));
    }

    #[tokio::test]
    async fn test_wait_rejects_bad_tick_increase() {
        for increase in [-1.0, 0.0, f64::NAN, f64::INFINITY] {
            let err = wait(
                "x",
                || async { Err::<(), _>(TestbedError::WaitingIncomplete) },
                Duration::from_secs(1),
                0.01,
                increase,
            )
            .await
            .unwrap_err();
            assert!(err.message().contains("Tick increase must be a positive number"));
        }
    }

    #[tokio::test]
    async fn test_wait_huge_tick_is_an_error() {
        let err = wait(
            "grows",
            || async { Err::<(), _>(TestbedError::WaitingIncomplete) },
            Duration::from_secs(1),
            f64::MAX,
            1.0,
        )
        .await
        .unwrap_err();
        assert!(err.message().contains("Invalid tick"));
    }

    #[tokio::test]
    async fn test_wait_propagates_other_errors() {
        let err = wait(
            "broken",
            || async { Err::<(), _>(TestbedError::general("boom")) },
            Duration::from_secs(1),
            0.01,
            1.0,
        )
        .await
        .unwrap_err();

        assert_eq!(err.message(), "boom");
    }
}
