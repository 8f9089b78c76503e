//! Release handles: every acquired resource (slot, mutex, wait-counter seat)
//! is wrapped in a release-once guard that also fires when the client
//! disconnects, so early returns and dropped connections cannot leak slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Background releases get a fresh, short deadline so they succeed even when
/// the request context is already cancelled.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

type ReleaseAction = Box<dyn FnOnce() + Send>;

struct Shared {
    released: AtomicBool,
    done: CancellationToken,
    action: Mutex<Option<ReleaseAction>>,
}

/// Idempotent release of one acquired resource.
///
/// Cloning shares the once-guard: the underlying action runs exactly once no
/// matter how many clones call [`ReleaseHandle::release`].
#[derive(Clone)]
pub struct ReleaseHandle {
    inner: Arc<Shared>,
}

impl ReleaseHandle {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Shared {
                released: AtomicBool::new(false),
                done: CancellationToken::new(),
                action: Mutex::new(Some(Box::new(action))),
            }),
        }
    }

    /// Handle for the no-limit fast path: releasing does nothing.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Wrap an async release operation; it runs detached with its own
    /// timeout when the handle fires.
    pub fn spawn_on_release<F>(release: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self::new(move || {
            tokio::spawn(async move {
                let _ = tokio::time::timeout(RELEASE_TIMEOUT, release).await;
            });
        })
    }

    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let action = self.inner.action.lock().expect("release action poisoned").take();
        if let Some(action) = action {
            action();
        }
        // Wakes the cancellation listener so it does not outlive the request.
        self.inner.done.cancel();
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Spawn a listener that releases when `cancel` fires first. The
    /// listener exits as soon as the handle is released normally.
    pub fn guard_on_cancel(self, cancel: &CancellationToken) -> Self {
        let inner = self.inner.clone();
        let cancel = cancel.clone();
        let done = self.inner.done.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => ReleaseHandle { inner }.release(),
                _ = done.cancelled() => {}
            }
        });
        self
    }
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn release_runs_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handle = ReleaseHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let clone = handle.clone();

        handle.release();
        clone.release();
        handle.release();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handle.is_released());
    }

    #[tokio::test]
    async fn cancellation_triggers_release() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();
        let handle = ReleaseHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .guard_on_cancel(&cancel);

        cancel.cancel();
        // Give the listener a chance to run.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // A later explicit release stays a no-op.
        handle.release();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn normal_release_beats_later_cancellation() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();
        let handle = ReleaseHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .guard_on_cancel(&cancel);

        handle.release();
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
