//! Run-level cancellation, the bounded retry loop shared by every network
//! stage, and the rule for when a FAILED stage is retried at all.

use std::future::Future;

use curio_core::{CurioError, StageManifest, StageState};
use curio_storage::BackoffPolicy;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Flips the run's [`CancelSignal`]s; dropping it does not cancel.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace never fails, even with every receiver gone.
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender dropped without cancelling; nothing will ever fire.
            std::future::pending::<()>().await;
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts `policy`.
///
/// Only retryable errors are retried. Cancellation is checked before every
/// attempt and interrupts the backoff sleep.
pub async fn with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancelSignal,
    label: &str,
    mut op: F,
) -> Result<T, CurioError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, CurioError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(CurioError::Cancelled);
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    label,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(CurioError::Cancelled),
                }
                attempt += 1;
            }
            Err(err) => {
                debug!(label, attempts = attempt + 1, error = %err, "giving up");
                return Err(err);
            }
        }
    }
}

const INTEGRITY_PREFIX: &str = "integrity:";

/// Why a FAILED stage record is not retried this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeldBack {
    /// Failed an integrity check; stays put until an operator clears its record.
    Quarantined { reason: String },
    RetryLimit { attempts: u32, reason: Option<String> },
}

pub fn held_back(prior: &StageManifest, max_run_retries: u32) -> Option<HeldBack> {
    if prior.state != StageState::Failed {
        return None;
    }
    if let Some(reason) = prior
        .reason
        .as_deref()
        .filter(|reason| reason.starts_with(INTEGRITY_PREFIX))
    {
        return Some(HeldBack::Quarantined {
            reason: reason.to_string(),
        });
    }
    (prior.attempts >= max_run_retries).then(|| HeldBack::RetryLimit {
        attempts: prior.attempts,
        reason: prior.reason.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_policy(max_attempts: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_up_to_the_cap() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_backoff(&fast_policy(3), &CancelSignal::never(), "t", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CurioError::transient("u", "503")) }
        })
        .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_stop_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_backoff(&fast_policy(5), &CancelSignal::never(), "t", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CurioError::integrity("bad checksum")) }
        })
        .await;
        assert!(matches!(result, Err(CurioError::Integrity(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_after_retry_returns_value() {
        let value = with_backoff(&fast_policy(3), &CancelSignal::never(), "t", |attempt| async move {
            if attempt == 0 {
                Err(CurioError::transient("u", "timeout"))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn cancelled_runs_issue_no_new_attempts() {
        let (handle, signal) = cancel_pair();
        handle.cancel();
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_backoff(&fast_policy(3), &signal, "t", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert!(matches!(result, Err(CurioError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(handle.signal().is_cancelled());
    }

    #[test]
    fn failed_records_are_held_back_by_integrity_or_attempt_count() {
        use chrono::Utc;
        use curio_core::Stage;

        let failed = |attempts: u32, reason: &str| {
            let mut manifest = StageManifest::pending("t", Stage::Merge, Utc::now());
            manifest.state = StageState::Failed;
            manifest.attempts = attempts;
            manifest.reason = Some(reason.to_string());
            manifest
        };
        assert_eq!(held_back(&failed(1, "transient_fetch: 503"), 3), None);
        assert_eq!(
            held_back(&failed(3, "transient_fetch: 503"), 3),
            Some(HeldBack::RetryLimit {
                attempts: 3,
                reason: Some("transient_fetch: 503".into())
            })
        );
        assert!(matches!(
            held_back(&failed(1, "integrity: integrity error: sha mismatch"), 3),
            Some(HeldBack::Quarantined { .. })
        ));
        let mut done = failed(5, "x");
        done.state = StageState::Done;
        assert_eq!(held_back(&done, 3), None);
    }
}
