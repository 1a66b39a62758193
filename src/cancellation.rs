//! Cooperative cancellation context shared by cache and database operations
//! (§5.1).
//!
//! A dependency-free alternative to a dedicated cancellation-token crate: a
//! flag plus a `Notify` to wake any operation racing against it. Cloning a
//! [`Cancellation`] shares the same underlying flag, so cancelling one handle
//! cancels every clone and every in-flight operation guarded by it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{CacheError, DbError};

/// Cooperative cancellation handle passed into cache and database operations.
/// `cancel()` is idempotent and safe to call from any task holding a clone.
#[derive(Clone)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Marks every clone of this handle cancelled and wakes any operation
    /// currently racing against [`Cancellation::guard`].
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Races `fut` against cancellation. If this handle is cancelled before
    /// `fut` resolves, `fut` is dropped and this returns `E::cancelled()`.
    pub async fn guard<T, E, F>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Cancellable,
    {
        tokio::select! {
            result = fut => result,
            _ = self.cancelled() => Err(E::cancelled()),
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented by error types carrying a dedicated `Cancelled` sentinel, so
/// [`Cancellation::guard`] can construct the right variant generically.
pub trait Cancellable {
    fn cancelled() -> Self;
}

impl Cancellable for CacheError {
    fn cancelled() -> Self {
        CacheError::Cancelled
    }
}

impl Cancellable for DbError {
    fn cancelled() -> Self {
        DbError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn guard_passes_through_ok_when_never_cancelled() {
        let ctx = Cancellation::new();
        let result: Result<i32, CacheError> = ctx.guard(async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn guard_surfaces_cancelled_once_cancel_fires() {
        let ctx = Cancellation::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result: Result<i32, CacheError> = ctx
            .guard(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(CacheError::Cancelled)));
    }

    #[tokio::test]
    async fn guard_observes_cancellation_requested_before_it_starts() {
        let ctx = Cancellation::new();
        ctx.cancel();
        let result: Result<i32, DbError> = ctx
            .guard(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(DbError::Cancelled)));
    }
}
