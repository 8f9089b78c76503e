//! Wait loops: retry an acquisition with backoff while keeping streaming
//! clients alive and bailing out on cancellation or deadline.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;
use crate::sse::ReplyChannel;
use crate::store::StoreError;

use super::backoff::Backoff;

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout waiting for {slot_type} concurrency slot")]
    Timeout { slot_type: &'static str },
    #[error("client disconnected while waiting for {slot_type} slot")]
    Cancelled { slot_type: &'static str },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WaitError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WaitError::Cancelled { .. })
    }
}

/// One configured wait: overall deadline, backoff schedule, and ping cadence.
pub struct Waiter<'a> {
    pub(super) slot_type: &'static str,
    pub(super) timeout: Duration,
    pub(super) backoff: &'a BackoffConfig,
    pub(super) ping_interval: Duration,
}

impl Waiter<'_> {
    /// Retry `attempt` until it yields a value, the deadline passes, or the
    /// request is cancelled. Streaming requests get a ping frame on every
    /// ping tick so intermediaries keep the connection open.
    pub async fn run<T, F, Fut>(
        &self,
        reply: &mut ReplyChannel,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, WaitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, StoreError>>,
    {
        if let Some(value) = attempt().await? {
            return Ok(value);
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + self.ping_interval,
            self.ping_interval,
        );
        let mut backoff = Backoff::new(self.backoff);
        let mut retry_at = tokio::time::Instant::now() + backoff.next_delay();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(WaitError::Cancelled { slot_type: self.slot_type });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(WaitError::Timeout { slot_type: self.slot_type });
                }
                _ = ping.tick() => {
                    if reply.is_stream() && reply.write_ping().await.is_err() {
                        return Err(WaitError::Cancelled { slot_type: self.slot_type });
                    }
                }
                _ = tokio::time::sleep_until(retry_at) => {
                    if let Some(value) = attempt().await? {
                        return Ok(value);
                    }
                    retry_at = tokio::time::Instant::now() + backoff.next_delay();
                }
            }
        }
    }

    /// Sleep for a fixed duration, still pinging and honoring cancellation.
    pub async fn sleep(
        &self,
        duration: Duration,
        reply: &mut ReplyChannel,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        let wake_at = tokio::time::Instant::now() + duration;
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + self.ping_interval,
            self.ping_interval,
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(WaitError::Cancelled { slot_type: self.slot_type });
                }
                _ = ping.tick() => {
                    if reply.is_stream() && reply.write_ping().await.is_err() {
                        return Err(WaitError::Cancelled { slot_type: self.slot_type });
                    }
                }
                _ = tokio::time::sleep_until(wake_at) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::PingFormat;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn waiter(backoff: &BackoffConfig, timeout_ms: u64) -> Waiter<'_> {
        Waiter {
            slot_type: "test",
            timeout: Duration::from_millis(timeout_ms),
            backoff,
            ping_interval: Duration::from_millis(25),
        }
    }

    #[tokio::test]
    async fn returns_once_attempt_succeeds() {
        let backoff = BackoffConfig {
            initial_ms: 5,
            max_ms: 10,
            multiplier: 1.5,
            jitter: 0.0,
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let (mut reply, _rx) = ReplyChannel::pair(false, PingFormat::None);
        let cancel = CancellationToken::new();

        let value = waiter(&backoff, 1_000)
            .run(&mut reply, &cancel, move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) >= 2 {
                        Ok(Some(42u32))
                    } else {
                        Ok(None)
                    }
                }
            })
            .await
            .expect("acquired");

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deadline_produces_timeout() {
        let backoff = BackoffConfig {
            initial_ms: 5,
            max_ms: 10,
            multiplier: 1.5,
            jitter: 0.0,
        };
        let (mut reply, _rx) = ReplyChannel::pair(false, PingFormat::None);
        let cancel = CancellationToken::new();

        let result: Result<u32, _> = waiter(&backoff, 30)
            .run(&mut reply, &cancel, || async { Ok(None) })
            .await;
        match result {
            Err(WaitError::Timeout { slot_type }) => assert_eq!(slot_type, "test"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_wins_immediately() {
        let backoff = BackoffConfig {
            initial_ms: 50,
            max_ms: 100,
            multiplier: 1.5,
            jitter: 0.0,
        };
        let (mut reply, _rx) = ReplyChannel::pair(false, PingFormat::None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<u32, _> = waiter(&backoff, 10_000)
            .run(&mut reply, &cancel, || async { Ok(None) })
            .await;
        assert!(matches!(result, Err(WaitError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn streaming_wait_emits_pings() {
        let backoff = BackoffConfig {
            initial_ms: 200,
            max_ms: 400,
            multiplier: 1.5,
            jitter: 0.0,
        };
        let (mut reply, mut rx) = ReplyChannel::pair(true, PingFormat::Claude);
        let cancel = CancellationToken::new();

        let result: Result<u32, _> = waiter(&backoff, 90)
            .run(&mut reply, &cancel, || async { Ok(None) })
            .await;
        assert!(matches!(result, Err(WaitError::Timeout { .. })));

        // At least two ping ticks fit into the 90ms window.
        let frame = rx.body.recv().await.expect("ping frame");
        assert_eq!(frame.as_ref(), b"data: {\"type\": \"ping\"}\n\n");
        assert!(rx.body.recv().await.is_some());
    }
}
