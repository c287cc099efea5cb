//! Per-test context handed to every test body.
//!
//! A [`TestContext`] lives for exactly one test. It binds the interaction
//! primitives to the engine's current device handle and the test's
//! cancellation token, keeps track of the subscriptions the test opened so
//! they can be released when it ends, and remembers the last value seen on
//! each characteristic for failure reports.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::case::{TestError, TestResult};
use crate::config::InteractionSettings;
use crate::interact::subscription::{self, OrphanList};
use crate::interact::{self, InteractionError, Link, Subscription};
use crate::transport::{CharacteristicId, DeviceHandle, ServiceMap, Transport};

pub struct TestContext {
    name: String,
    transport: Arc<dyn Transport>,
    handle: DeviceHandle,
    services: Arc<ServiceMap>,
    settings: InteractionSettings,
    cancel: CancellationToken,
    subscriptions: AsyncMutex<HashMap<CharacteristicId, Subscription>>,
    orphans: OrphanList,
    observed: Mutex<BTreeMap<CharacteristicId, Vec<u8>>>,
    connection_lost: AtomicBool,
}

impl TestContext {
    pub(crate) fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        handle: DeviceHandle,
        services: Arc<ServiceMap>,
        settings: InteractionSettings,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            handle,
            services,
            settings,
            cancel: CancellationToken::new(),
            subscriptions: AsyncMutex::new(HashMap::new()),
            orphans: Arc::new(Mutex::new(Vec::new())),
            observed: Mutex::new(BTreeMap::new()),
            connection_lost: AtomicBool::new(false),
        }
    }

    /// Qualified name of the running test.
    pub fn test_name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.handle
    }

    /// Services discovered when the device was connected.
    pub fn services(&self) -> &ServiceMap {
        &self.services
    }

    pub fn settings(&self) -> &InteractionSettings {
        &self.settings
    }

    /// Fires when the test deadline expires. Long-running custom loops in a
    /// body should watch it; the built-in primitives already do.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn link(&self) -> Link<'_> {
        Link {
            transport: self.transport.as_ref(),
            handle: &self.handle,
            cancel: &self.cancel,
        }
    }

    // -----------------------------------------------------------------------
    // Interaction primitives
    // -----------------------------------------------------------------------

    /// Read with the configured default timeout and retry budget.
    pub async fn read(&self, characteristic: &CharacteristicId) -> Result<Vec<u8>, InteractionError> {
        self.read_characteristic(
            characteristic,
            self.settings.read_timeout(),
            self.settings.read_retries,
        )
        .await
    }

    pub async fn read_characteristic(
        &self,
        characteristic: &CharacteristicId,
        timeout: Duration,
        retries: u32,
    ) -> Result<Vec<u8>, InteractionError> {
        let result = interact::read_characteristic(&self.link(), characteristic, timeout, retries).await;
        if let Ok(value) = &result {
            self.observe(characteristic, value);
        }
        self.track(result)
    }

    /// Write with the configured default timeout and write retry budget
    /// (zero unless configured otherwise).
    pub async fn write(&self, characteristic: &CharacteristicId, data: &[u8]) -> Result<(), InteractionError> {
        self.write_characteristic(
            characteristic,
            data,
            self.settings.write_timeout(),
            self.settings.write_retries,
        )
        .await
    }

    pub async fn write_characteristic(
        &self,
        characteristic: &CharacteristicId,
        data: &[u8],
        timeout: Duration,
        retries: u32,
    ) -> Result<(), InteractionError> {
        let result =
            interact::write_characteristic(&self.link(), characteristic, data, timeout, retries).await;
        if result.is_ok() {
            self.observe(characteristic, data);
        }
        self.track(result)
    }

    /// Open a subscription that stays up until the test ends or
    /// [`TestContext::unsubscribe`] is called. While it is open,
    /// [`TestContext::wait_for_notification`] waits on it instead of
    /// subscribing again. Notifications arriving between waits are dropped.
    pub async fn subscribe(&self, characteristic: &CharacteristicId) -> Result<(), InteractionError> {
        let mut subs = self.subscriptions.lock().await;
        if subs.contains_key(characteristic) {
            return Ok(());
        }
        let sub = Subscription::open(
            &self.link(),
            characteristic,
            self.settings.notification_timeout(),
            Arc::clone(&self.orphans),
            false,
        )
        .await;
        let sub = self.track(sub)?;
        subs.insert(*characteristic, sub);
        Ok(())
    }

    pub async fn unsubscribe(&self, characteristic: &CharacteristicId) -> Result<(), InteractionError> {
        let sub = self.subscriptions.lock().await.remove(characteristic);
        match sub {
            Some(sub) => {
                let result = sub.release(&self.link()).await;
                self.track(result)
            }
            None => Ok(()),
        }
    }

    /// Wait for the first notification on `characteristic` accepted by
    /// `predicate`, subscribing for the duration of the wait unless a
    /// subscription is already open.
    pub async fn wait_for_notification<P>(
        &self,
        characteristic: &CharacteristicId,
        predicate: P,
        timeout: Duration,
    ) -> Result<Vec<u8>, InteractionError>
    where
        P: FnMut(&[u8]) -> bool + Send,
    {
        // A held subscription is taken out of the map for the wait; if the
        // body is abandoned mid-wait it lands on the orphan list instead.
        let held = self.subscriptions.lock().await.remove(characteristic);
        let (result, last) = match held {
            Some(mut sub) => {
                let result = sub.next_matching(predicate, timeout, &self.cancel).await;
                let last = sub.last_payload().map(<[u8]>::to_vec);
                self.subscriptions.lock().await.insert(*characteristic, sub);
                (result, last)
            }
            None => {
                interact::wait_for_notification(
                    &self.link(),
                    characteristic,
                    predicate,
                    timeout,
                    Arc::clone(&self.orphans),
                )
                .await
            }
        };
        if let Some(last) = last {
            self.observe(characteristic, &last);
        }
        self.track(result)
    }

    /// Wait for a notification carrying exactly `expected`.
    pub async fn wait_for_value(
        &self,
        characteristic: &CharacteristicId,
        expected: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, InteractionError> {
        self.wait_for_notification(characteristic, |payload| payload == expected, timeout)
            .await
    }

    /// Poll `check` until it returns `true`, using the configured poll
    /// interval.
    pub async fn wait_for_condition<F, Fut>(&self, check: F, timeout: Duration) -> Result<(), InteractionError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<bool, InteractionError>> + Send,
    {
        self.wait_for_condition_every(check, timeout, self.settings.poll_interval())
            .await
    }

    pub async fn wait_for_condition_every<F, Fut>(
        &self,
        check: F,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), InteractionError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<bool, InteractionError>> + Send,
    {
        let result = interact::wait_for_condition(&self.cancel, check, timeout, interval).await;
        self.track(result)
    }

    /// Sleep that ends early, with `Cancelled`, when the deadline fires.
    pub async fn sleep(&self, duration: Duration) -> Result<(), InteractionError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(InteractionError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Assertions
    // -----------------------------------------------------------------------

    pub fn ensure(&self, condition: bool, message: impl Into<String>) -> TestResult {
        if condition {
            Ok(())
        } else {
            Err(TestError::Failed(message.into()))
        }
    }

    pub fn ensure_eq<T: PartialEq + Debug>(&self, actual: T, expected: T, what: &str) -> TestResult {
        if actual == expected {
            Ok(())
        } else {
            Err(TestError::Failed(format!(
                "{}: expected {:?}, got {:?}",
                what, expected, actual
            )))
        }
    }

    pub fn fail(&self, message: impl Into<String>) -> TestError {
        TestError::Failed(message.into())
    }

    pub fn skip(&self, reason: impl Into<String>) -> TestError {
        TestError::Skipped(reason.into())
    }

    // -----------------------------------------------------------------------
    // Engine-facing
    // -----------------------------------------------------------------------

    fn observe(&self, characteristic: &CharacteristicId, value: &[u8]) {
        if let Ok(mut observed) = self.observed.lock() {
            observed.insert(*characteristic, value.to_vec());
        }
    }

    fn track<T>(&self, result: Result<T, InteractionError>) -> Result<T, InteractionError> {
        if let Err(e) = &result {
            if e.is_connection_loss() {
                self.connection_lost.store(true, Ordering::Release);
            }
        }
        result
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Swap in a fresh token so teardown can still talk to the device after
    /// the body was cancelled.
    pub(crate) fn rearm(&mut self) {
        self.cancel = CancellationToken::new();
    }

    pub(crate) fn saw_connection_loss(&self) -> bool {
        self.connection_lost.load(Ordering::Acquire)
    }

    /// Last observed value per characteristic, hex encoded.
    pub(crate) fn captured_state(&self) -> BTreeMap<String, String> {
        match self.observed.lock() {
            Ok(observed) => observed
                .iter()
                .map(|(id, value)| (id.to_string(), hex::encode(value)))
                .collect(),
            Err(_) => BTreeMap::new(),
        }
    }

    /// Release every subscription the test still holds, including ones
    /// abandoned by a cancelled body.
    pub(crate) async fn release_all(&self) {
        let held: Vec<Subscription> = self
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        let link = self.link();
        for sub in held {
            let characteristic = *sub.characteristic();
            if let Err(e) = sub.release(&link).await {
                warn!(%characteristic, error = %e, "failed to release subscription");
            }
        }
        subscription::release_orphans(&link, &self.orphans).await;
        debug!(test = %self.name, "context released");
    }
}
