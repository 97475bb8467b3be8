//! Request deadlines with cooperative cancellation.
//!
//! A [`Deadline`] is created once per request by the timeout guard and handed
//! to every downstream call. It carries an optional expiry instant and a
//! cancellation token; a bounded call completes with [`DeadlineExceeded`] as
//! soon as either fires. Work that already committed is not rolled back.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Error returned when a bounded call outlives its request deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// A cancellable, deadline-bearing request context.
///
/// Clones share the same cancellation token, so cancelling any clone cancels
/// every call bounded by the original.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Option<Instant>,
    token: CancellationToken,
}

impl Deadline {
    /// Deadline that expires `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// Deadline that expires at the given instant.
    pub fn at(at: Instant) -> Self {
        Self {
            at: Some(at),
            token: CancellationToken::new(),
        }
    }

    /// Deadline that only ends when cancelled explicitly.
    pub fn unbounded() -> Self {
        Self {
            at: None,
            token: CancellationToken::new(),
        }
    }

    /// Returns a deadline that expires no later than `limit` from now.
    ///
    /// The narrowed deadline shares the cancellation token of `self`.
    #[must_use]
    pub fn narrowed(&self, limit: Duration) -> Self {
        let candidate = Instant::now() + limit;
        let at = match self.at {
            Some(at) if at <= candidate => at,
            _ => candidate,
        };
        Self {
            at: Some(at),
            token: self.token.clone(),
        }
    }

    /// The expiry instant, if any.
    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Time left before expiry. `None` for an unbounded deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed or was cancelled.
    pub fn is_expired(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        matches!(self.at, Some(at) if Instant::now() >= at)
    }

    /// Raises the cancellation signal for every call bounded by this deadline.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Completes when the deadline passes or is cancelled.
    pub async fn expired(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = sleep_until(self.at) => {}
        }
    }

    /// Runs `fut` to completion unless the deadline fires first.
    ///
    /// The future is dropped at its next suspension point once the deadline
    /// fires; effects it already produced are kept.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, DeadlineExceeded>
    where
        F: Future,
    {
        if self.is_expired() {
            return Err(DeadlineExceeded);
        }
        tokio::select! {
            biased;
            out = fut => Ok(out),
            _ = self.expired() => Err(DeadlineExceeded),
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::unbounded()
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_completes_before_deadline() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let out = deadline.run(async { 42 }).await;
        assert_eq!(out, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn run_fails_once_deadline_passes() {
        let deadline = Deadline::after(Duration::from_millis(100));
        let out = deadline
            .run(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(out, Err(DeadlineExceeded));
        assert!(deadline.is_expired());
    }

    #[tokio::test]
    async fn expired_deadline_rejects_without_polling() {
        let deadline = Deadline::after(Duration::ZERO);
        let mut polled = false;
        let out = deadline
            .run(async {
                polled = true;
            })
            .await;
        assert_eq!(out, Err(DeadlineExceeded));
        assert!(!polled);
    }

    #[tokio::test]
    async fn cancel_propagates_to_clones() {
        let deadline = Deadline::unbounded();
        let child = deadline.clone();
        let waiter = tokio::spawn(async move {
            child
                .run(std::future::pending::<()>())
                .await
        });
        deadline.cancel();
        assert_eq!(waiter.await.unwrap(), Err(DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn narrowed_keeps_earlier_instant() {
        let outer = Deadline::after(Duration::from_secs(1));
        let narrowed = outer.narrowed(Duration::from_secs(30));
        assert_eq!(narrowed.instant(), outer.instant());

        let tighter = outer.narrowed(Duration::from_millis(10));
        assert!(tighter.instant() < outer.instant());

        outer.cancel();
        assert!(tighter.is_expired());
    }

    #[test]
    fn unbounded_has_no_remaining() {
        let deadline = Deadline::unbounded();
        assert_eq!(deadline.remaining(), None);
        assert!(!deadline.is_expired());
    }
}
