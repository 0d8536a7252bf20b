//! Bounded, fixed-delay retry loops that can be cancelled between attempts.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::error::RetryError;

/// Fixed attempt count with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Single attempt, no waiting.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `attempt` until it succeeds, the attempts run out, or `cancel` fires.
    ///
    /// `attempt` receives the zero-based attempt number. A policy with zero attempts
    /// still runs once.
    pub async fn retry<T, E, F, Fut>(
        &self,
        cancel: &Cancellation,
        what: &str,
        mut attempt: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut n = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            let last = match attempt(n).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            n += 1;
            if n >= attempts {
                return Err(RetryError::Exhausted { attempts, last });
            }
            debug!(
                "{} failed (attempt {}/{}): {}, retrying in {:?}",
                what, n, attempts, last, self.delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
    }

    /// Poll `check` until it reports true. Errors from `check` count as "not yet".
    pub async fn poll_until<E, F, Fut>(
        &self,
        cancel: &Cancellation,
        what: &str,
        mut check: F,
    ) -> Result<(), RetryError<String>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: std::fmt::Display,
    {
        self.retry(cancel, what, |_| {
            let fut = check();
            async move {
                match fut.await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(format!("{} not ready", what)),
                    Err(e) => Err(e.to_string()),
                }
            }
        })
        .await
    }
}

/// Trigger side of a [`Cancellation`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> Cancellation {
        Cancellation {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cheap, clonable cancellation signal observed by retry loops and background tasks.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

/// Create a linked handle/token pair.
pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancellation { rx })
}

impl Cancellation {
    /// A token that never fires.
    pub fn never() -> Self {
        let (_, token) = cancellation();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Never resolves if the handle was dropped uncancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<u32, RetryError<String>> = policy
            .retry(&Cancellation::never(), "link lookup", move |n| {
                c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(format!("attempt {}", n))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_keeps_last_error() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let result: Result<(), RetryError<String>> = policy
            .retry(&Cancellation::never(), "link lookup", |n| async move {
                Err(format!("failure {}", n))
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "failure 2");
            }
            other => panic!("unexpected {:?}", other.map_err(|e| e.to_string())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_runs_once() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let _ = policy
            .retry(&Cancellation::never(), "link lookup", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("nope") }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_delay() {
        let (handle, token) = cancellation();
        let policy = RetryPolicy::new(100, Duration::from_secs(3600));

        let task = tokio::spawn(async move {
            policy
                .poll_until(&token, "never ready", || async { Ok::<_, String>(false) })
                .await
        });

        tokio::task::yield_now().await;
        handle.cancel();
        let result = task.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_skips_attempt() {
        let (handle, token) = cancellation();
        handle.cancel();
        let result = RetryPolicy::once()
            .poll_until(&token, "check", || async { Ok::<_, String>(true) })
            .await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
