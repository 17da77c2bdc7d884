//! Optimistic-concurrency retry with exponential backoff, base 100 ms
//! capped at 10 s. Shared by the Sandbox/WarmPool/WarmPod
//! reconcilers so each status write collapses losers into a local retry
//! instead of surfacing a conflict error to the controller's own
//! requeue/backoff machinery.

use std::time::Duration;

use tokio::time::sleep;

const BASE: Duration = Duration::from_millis(100);
const CAP: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 8;

fn backoff_for(attempt: u32) -> Duration {
    let scaled = BASE.saturating_mul(1 << attempt.min(20));
    scaled.min(CAP)
}

/// Retries `op` while it returns a `kube::Error::Api` with code 409,
/// sleeping with exponential backoff between attempts. Any other error is
/// returned immediately.
pub async fn with_conflict_retry<T, F, Fut>(mut op: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, kube::Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(kube::Error::Api(e)) if e.code == 409 && attempt < MAX_ATTEMPTS => {
                sleep(backoff_for(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_then_caps() {
        assert_eq!(backoff_for(0), Duration::from_millis(100));
        assert_eq!(backoff_for(1), Duration::from_millis(200));
        assert_eq!(backoff_for(6), Duration::from_millis(6400));
        assert_eq!(backoff_for(10), CAP);
    }

    #[tokio::test]
    async fn succeeds_immediately_without_conflict() {
        let mut calls = 0;
        let result = with_conflict_retry(|| {
            calls += 1;
            async { Ok::<_, kube::Error>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retries_on_409_then_succeeds() {
        let mut calls = 0;
        let result = with_conflict_retry(|| {
            calls += 1;
            let this_call = calls;
            async move {
                if this_call < 3 {
                    Err(kube::Error::Api(kube::core::ErrorResponse {
                        status: "Failure".into(),
                        message: "conflict".into(),
                        reason: "Conflict".into(),
                        code: 409,
                    }))
                } else {
                    Ok(this_call)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }
}
