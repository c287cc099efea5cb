//! Interaction primitives: read, write, wait-for-notification and
//! wait-for-condition with timeout, retry and cancellation semantics.
//!
//! Every primitive is a suspension point of the test body. Each one races its
//! transport call against the test's [`CancellationToken`] and its own
//! deadline, and cleans up (e.g. unsubscribes) before returning an error.

pub mod subscription;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::{CharacteristicId, DeviceHandle, Transport, TransportError};

pub use subscription::Subscription;
use subscription::OrphanList;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InteractionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{what} did not complete within {after:?}")]
    TimedOut { what: String, after: Duration },

    #[error("cancelled by the test deadline")]
    Cancelled,
}

impl InteractionError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            InteractionError::TimedOut { .. } | InteractionError::Transport(TransportError::Timeout(_))
        )
    }

    pub fn is_connection_loss(&self) -> bool {
        matches!(self, InteractionError::Transport(TransportError::Connection(_)))
    }
}

/// Everything a primitive needs to reach the device: the adapter, the handle
/// it operates on, and the cancellation signal of the current test.
#[derive(Clone, Copy)]
pub struct Link<'a> {
    pub transport: &'a dyn Transport,
    pub handle: &'a DeviceHandle,
    pub cancel: &'a CancellationToken,
}

/// Race one transport call against cancellation and a deadline.
pub(crate) async fn guarded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    op: F,
) -> Result<T, InteractionError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    if cancel.is_cancelled() {
        return Err(InteractionError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(InteractionError::Cancelled),
        res = tokio::time::timeout(timeout, op) => match res {
            Ok(res) => res.map_err(InteractionError::from),
            Err(_) => Err(TransportError::Timeout(timeout).into()),
        },
    }
}

/// Read a characteristic, retrying `retries` more times on timeouts and link
/// errors with the same per-attempt timeout. The last error is surfaced.
pub async fn read_characteristic(
    link: &Link<'_>,
    characteristic: &CharacteristicId,
    timeout: Duration,
    retries: u32,
) -> Result<Vec<u8>, InteractionError> {
    let attempts = retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        match guarded(
            link.cancel,
            timeout,
            link.transport.read(link.handle, characteristic, timeout),
        )
        .await
        {
            Ok(value) => {
                debug!(%characteristic, value = %hex::encode(&value), attempt, "read");
                return Ok(value);
            }
            Err(InteractionError::Transport(e)) if e.is_transient() && attempt < attempts => {
                warn!(%characteristic, attempt, attempts, error = %e, "read failed, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Write a characteristic.
///
/// Writes may trigger device actions, so nothing is re-sent unless the
/// caller asks for it with `retries > 0`.
pub async fn write_characteristic(
    link: &Link<'_>,
    characteristic: &CharacteristicId,
    data: &[u8],
    timeout: Duration,
    retries: u32,
) -> Result<(), InteractionError> {
    let attempts = retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        match guarded(
            link.cancel,
            timeout,
            link.transport.write(link.handle, characteristic, data, timeout),
        )
        .await
        {
            Ok(()) => {
                debug!(%characteristic, value = %hex::encode(data), attempt, "write");
                return Ok(());
            }
            Err(InteractionError::Transport(e)) if e.is_transient() && attempt < attempts => {
                warn!(%characteristic, attempt, attempts, error = %e, "write failed, re-sending");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Subscribe, wait for the first payload matching `predicate`, unsubscribe.
///
/// Payloads count from the moment the subscribe is issued. The unsubscribe
/// happens exactly once on every path, including timeout and cancellation. Returns the matching payload together with the last
/// payload seen, which differ only when the wait failed.
pub(crate) async fn wait_for_notification<P>(
    link: &Link<'_>,
    characteristic: &CharacteristicId,
    predicate: P,
    timeout: Duration,
    orphans: OrphanList,
) -> (Result<Vec<u8>, InteractionError>, Option<Vec<u8>>)
where
    P: FnMut(&[u8]) -> bool + Send,
{
    let mut sub = match Subscription::open(link, characteristic, timeout, orphans, true).await {
        Ok(sub) => sub,
        Err(e) => return (Err(e), None),
    };
    let result = sub.next_matching(predicate, timeout, link.cancel).await;
    let last = sub.last_payload().map(<[u8]>::to_vec);
    if let Err(e) = sub.release(link).await {
        warn!(%characteristic, error = %e, "unsubscribe failed");
    }
    (result, last)
}

/// Poll `check` every `interval` until it reports `true`.
///
/// Fails with `TimedOut` when `timeout` elapses first; errors from `check`
/// end the wait immediately.
pub async fn wait_for_condition<F, Fut>(
    cancel: &CancellationToken,
    mut check: F,
    timeout: Duration,
    interval: Duration,
) -> Result<(), InteractionError>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<bool, InteractionError>> + Send,
{
    let deadline = Instant::now() + timeout;
    let timed_out = || InteractionError::TimedOut {
        what: "condition".to_string(),
        after: timeout,
    };

    loop {
        if cancel.is_cancelled() {
            return Err(InteractionError::Cancelled);
        }
        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InteractionError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(timed_out()),
            ready = check() => ready?,
        };
        if ready {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(timed_out());
        }
        let wake = (now + interval).min(deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InteractionError::Cancelled),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}
