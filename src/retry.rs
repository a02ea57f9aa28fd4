use std::{future::Future, time::Duration};

use tracing::trace;

use crate::{Error, Result};

/// Poll `check` every `interval` until it reports `true`, giving up after `timeout`.
///
/// Transient errors from `check` are treated as "not yet"; anything else aborts the
/// wait. Dropping the returned future cancels the wait.
pub async fn poll_until<F, Fut>(
    interval: Duration,
    timeout: Duration,
    what: impl Into<String>,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let what = what.into();
    let waiting = async {
        loop {
            match check().await {
                Ok(true) => return Ok(()),
                Ok(false) => trace!("still waiting for {what}"),
                Err(e) if e.is_transient() => trace!("polling {what} failed, retrying: {e}"),
                Err(e) => return Err(e),
            }
            tokio::time::sleep(interval).await;
        }
    };

    let outcome = tokio::time::timeout(timeout, waiting).await;
    match outcome {
        Ok(result) => result,
        Err(_) => Err(Error::ReadinessTimeout { what, timeout }),
    }
}

/// Exponential per-item backoff: `base * 2^(failures - 1)`, capped at `max`
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn returns_once_the_predicate_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        poll_until(
            Duration::from_millis(1),
            Duration::from_secs(5),
            "third call",
            || {
                let counter = counter.clone();
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_as_a_transient_error() {
        let err = poll_until(
            Duration::from_millis(1),
            Duration::from_millis(20),
            "never",
            || async { Ok(false) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ReadinessTimeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn fatal_errors_abort_the_wait() {
        let err = poll_until(
            Duration::from_millis(1),
            Duration::from_secs(5),
            "broken",
            || async { Err(Error::Validation("nope".into())) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn transient_errors_keep_polling() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        poll_until(
            Duration::from_millis(1),
            Duration::from_secs(5),
            "flaky",
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::StoreConflict {
                            kind: "StatefulSet".into(),
                            name: "mgo".into(),
                        })
                    } else {
                        Ok(true)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(200), Duration::from_secs(1));
    }
}
