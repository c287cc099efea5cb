//! Bounded-lifetime notification subscriptions.
//!
//! A [`Subscription`] owns the receiving end of a channel whose sending end
//! ([`NotificationSink`]) lives in the backend. The subscription only accepts
//! payloads while a wait is pending; anything the device emits in between is
//! dropped by the sink. A subscription opened for a single wait listens from
//! the moment it is requested, so a value the device pushes as soon as
//! notifications are enabled reaches that wait.
//!
//! Releasing is explicit and async ([`Subscription::release`]). A subscription
//! dropped without being released, e.g. because a timed-out test body was
//! abandoned mid-wait, records its characteristic on an orphan list so the
//! owning context can unsubscribe it afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{guarded, InteractionError, Link};
use crate::transport::{CharacteristicId, NotificationSink};

/// Upper bound on an unsubscribe issued during cleanup.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Characteristics whose subscriptions were dropped without being released.
pub(crate) type OrphanList = Arc<Mutex<Vec<CharacteristicId>>>;

pub struct Subscription {
    characteristic: CharacteristicId,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    listening: Arc<AtomicBool>,
    orphans: OrphanList,
    last_payload: Option<Vec<u8>>,
    released: bool,
}

impl Subscription {
    /// Subscribe to `characteristic`.
    ///
    /// With `listen_now` the sink accepts payloads before the backend call
    /// returns; they are queued for the first [`Subscription::next_matching`].
    /// If the call is cancelled, times out or is dropped while in flight, the
    /// backend may already have enabled notifications, so the characteristic
    /// goes on the orphan list for a later unsubscribe.
    pub(crate) async fn open(
        link: &Link<'_>,
        characteristic: &CharacteristicId,
        timeout: Duration,
        orphans: OrphanList,
        listen_now: bool,
    ) -> Result<Self, InteractionError> {
        if link.cancel.is_cancelled() {
            return Err(InteractionError::Cancelled);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let listening = Arc::new(AtomicBool::new(listen_now));
        let sink = NotificationSink::new(tx, Arc::clone(&listening));

        let mut pending = PendingSubscribe {
            characteristic: *characteristic,
            orphans: &orphans,
            armed: true,
        };
        let result = guarded(
            link.cancel,
            timeout,
            link.transport.subscribe(link.handle, characteristic, sink),
        )
        .await;
        match &result {
            Err(InteractionError::Cancelled) => {}
            Err(e) if e.is_timeout() => {}
            // Either subscribed, or the backend refused outright.
            _ => pending.armed = false,
        }
        drop(pending);
        result?;
        debug!(%characteristic, listen_now, "subscribed");

        Ok(Self {
            characteristic: *characteristic,
            rx,
            listening,
            orphans,
            last_payload: None,
            released: false,
        })
    }

    pub fn characteristic(&self) -> &CharacteristicId {
        &self.characteristic
    }

    /// Most recent payload received by any wait on this subscription.
    pub fn last_payload(&self) -> Option<&[u8]> {
        self.last_payload.as_deref()
    }

    /// Wait for the first payload accepted by `predicate`.
    ///
    /// Payloads are examined in arrival order and none is skipped while the
    /// wait is pending. Fails with `TimedOut` once `timeout` elapses and with
    /// `Cancelled` as soon as `cancel` fires.
    pub async fn next_matching<P>(
        &mut self,
        mut predicate: P,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, InteractionError>
    where
        P: FnMut(&[u8]) -> bool + Send,
    {
        if cancel.is_cancelled() {
            return Err(InteractionError::Cancelled);
        }
        let deadline = Instant::now() + timeout;
        self.listening.store(true, Ordering::Release);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(InteractionError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    break Err(InteractionError::TimedOut {
                        what: format!("notification on {}", self.characteristic),
                        after: timeout,
                    });
                }
                payload = self.rx.recv() => match payload {
                    Some(payload) => {
                        let matched = predicate(&payload);
                        debug!(characteristic = %self.characteristic, payload = %hex::encode(&payload), matched, "notification");
                        self.last_payload = Some(payload.clone());
                        if matched {
                            break Ok(payload);
                        }
                    }
                    None => {
                        break Err(InteractionError::Transport(crate::transport::TransportError::Link(
                            format!("notification stream for {} closed", self.characteristic),
                        )));
                    }
                },
            }
        };

        self.listening.store(false, Ordering::Release);
        // Anything that slipped in after the wait ended belongs to no wait.
        while self.rx.try_recv().is_ok() {}
        result
    }

    /// Unsubscribe. Runs to completion even when the test is being cancelled.
    pub(crate) async fn release(mut self, link: &Link<'_>) -> Result<(), InteractionError> {
        self.released = true;
        self.listening.store(false, Ordering::Release);
        self.rx.close();

        match tokio::time::timeout(
            RELEASE_TIMEOUT,
            link.transport.unsubscribe(link.handle, &self.characteristic),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!(characteristic = %self.characteristic, "unsubscribed");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(InteractionError::TimedOut {
                what: format!("unsubscribe from {}", self.characteristic),
                after: RELEASE_TIMEOUT,
            }),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.listening.store(false, Ordering::Release);
        warn!(characteristic = %self.characteristic, "subscription dropped without release; deferring unsubscribe");
        if let Ok(mut orphans) = self.orphans.lock() {
            orphans.push(self.characteristic);
        }
    }
}

/// Queues a characteristic on the orphan list when dropped while armed.
struct PendingSubscribe<'a> {
    characteristic: CharacteristicId,
    orphans: &'a OrphanList,
    armed: bool,
}

impl Drop for PendingSubscribe<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(characteristic = %self.characteristic, "subscribe did not complete; deferring unsubscribe");
        if let Ok(mut orphans) = self.orphans.lock() {
            orphans.push(self.characteristic);
        }
    }
}

/// Unsubscribe everything on the orphan list. Used by test teardown.
pub(crate) async fn release_orphans(link: &Link<'_>, orphans: &OrphanList) {
    let pending: Vec<CharacteristicId> = match orphans.lock() {
        Ok(mut list) => list.drain(..).collect(),
        Err(_) => return,
    };
    for characteristic in pending {
        match tokio::time::timeout(
            RELEASE_TIMEOUT,
            link.transport.unsubscribe(link.handle, &characteristic),
        )
        .await
        {
            Ok(Ok(())) => debug!(%characteristic, "released orphaned subscription"),
            Ok(Err(e)) => warn!(%characteristic, error = %e, "failed to release orphaned subscription"),
            Err(_) => warn!(%characteristic, "timed out releasing orphaned subscription"),
        }
    }
}
