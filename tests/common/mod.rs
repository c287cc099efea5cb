//! Scripted in-memory transport for engine tests.
//!
//! Counts every call, can refuse connections, fail reads or writes, drop the
//! link on a given characteristic, stall subscribes, and replays
//! notification sequences to whoever subscribes.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use gattbench::transport::{
    CharacteristicId, CharacteristicProps, ConnectTarget, DeviceHandle, NotificationSink, ServiceMap,
    Transport, TransportError,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Nordic LED Button Service.
pub const LBS_SERVICE: Uuid = Uuid::from_u128(0x00001523_1212_efde_1523_785feabcd123);
pub const BUTTON: CharacteristicId = CharacteristicId::from_uuid(Uuid::from_u128(0x00001524_1212_efde_1523_785feabcd123));
pub const LED: CharacteristicId = CharacteristicId::from_uuid(Uuid::from_u128(0x00001525_1212_efde_1523_785feabcd123));
/// Battery level; not exposed by the mock device.
pub const BATTERY: CharacteristicId = CharacteristicId::from_short(0x2a19);

#[derive(Default)]
struct State {
    connect_failures: usize,
    connected: bool,
    session: usize,
    services: ServiceMap,
    values: HashMap<CharacteristicId, Vec<u8>>,
    read_failures: HashMap<CharacteristicId, VecDeque<TransportError>>,
    write_failures: HashMap<CharacteristicId, VecDeque<TransportError>>,
    subscribe_delay: Option<Duration>,
    on_subscribe: HashMap<CharacteristicId, Vec<u8>>,
    drop_link_on_read: Option<CharacteristicId>,
    notifications: HashMap<CharacteristicId, Vec<(Duration, Vec<u8>)>>,
    notifiers: HashMap<CharacteristicId, JoinHandle<()>>,
    written: Vec<(CharacteristicId, Vec<u8>)>,
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<State>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    discovers: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
}

impl MockTransport {
    /// A blinky-like device exposing LED (read/write) and BUTTON
    /// (read/notify).
    pub fn new() -> Self {
        let mock = Self::default();
        {
            let mut state = mock.state.lock().unwrap();
            state.services.insert(
                LBS_SERVICE,
                LED,
                CharacteristicProps {
                    read: true,
                    write: true,
                    notify: false,
                },
            );
            state.services.insert(
                LBS_SERVICE,
                BUTTON,
                CharacteristicProps {
                    read: true,
                    write: false,
                    notify: true,
                },
            );
            state.values.insert(LED, vec![0x00]);
            state.values.insert(BUTTON, vec![0x00]);
        }
        mock
    }

    pub fn fail_connects(self, n: usize) -> Self {
        self.state.lock().unwrap().connect_failures = n;
        self
    }

    pub fn with_value(self, id: CharacteristicId, value: &[u8]) -> Self {
        self.state.lock().unwrap().values.insert(id, value.to_vec());
        self
    }

    /// Fail the next reads of `id` with `errors`, in order.
    pub fn fail_reads(self, id: CharacteristicId, errors: Vec<TransportError>) -> Self {
        self.state
            .lock()
            .unwrap()
            .read_failures
            .insert(id, errors.into());
        self
    }

    /// Fail the next writes of `id` with `errors`, in order. A failed write
    /// leaves the stored value untouched.
    pub fn fail_writes(self, id: CharacteristicId, errors: Vec<TransportError>) -> Self {
        self.state
            .lock()
            .unwrap()
            .write_failures
            .insert(id, errors.into());
        self
    }

    /// Every subscribe call takes `delay` before it returns.
    pub fn slow_subscribe(self, delay: Duration) -> Self {
        self.state.lock().unwrap().subscribe_delay = Some(delay);
        self
    }

    /// Push `payload` from inside `subscribe`, before the call returns, the
    /// way devices report their current value once notifications are on.
    pub fn notify_on_subscribe(self, id: CharacteristicId, payload: &[u8]) -> Self {
        self.state.lock().unwrap().on_subscribe.insert(id, payload.to_vec());
        self
    }

    /// The first read of `id` kills the link.
    pub fn drop_link_on_read(self, id: CharacteristicId) -> Self {
        self.state.lock().unwrap().drop_link_on_read = Some(id);
        self
    }

    /// Emit `payload` `delay` after every subscribe to `id`; sequential
    /// calls queue further payloads, each delay measured from the previous.
    pub fn notify(self, id: CharacteristicId, delay: Duration, payload: &[u8]) -> Self {
        self.state
            .lock()
            .unwrap()
            .notifications
            .entry(id)
            .or_default()
            .push((delay, payload.to_vec()));
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<(CharacteristicId, Vec<u8>)> {
        self.state.lock().unwrap().written.clone()
    }

    fn require_link(&self) -> Result<(), TransportError> {
        if self.state.lock().unwrap().connected {
            Ok(())
        } else {
            Err(TransportError::Connection("not connected".into()))
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, target: &ConnectTarget) -> Result<DeviceHandle, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TransportError::Connection("device not advertising".into()));
        }
        state.connected = true;
        state.session += 1;
        Ok(DeviceHandle::connected(format!("mock-{}", state.session), target.clone()))
    }

    async fn disconnect(&self, _handle: &DeviceHandle) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        for (_, task) in state.notifiers.drain() {
            task.abort();
        }
        Ok(())
    }

    async fn discover(&self, _handle: &DeviceHandle) -> Result<ServiceMap, TransportError> {
        self.discovers.fetch_add(1, Ordering::SeqCst);
        self.require_link()?;
        Ok(self.state.lock().unwrap().services.clone())
    }

    async fn read(
        &self,
        _handle: &DeviceHandle,
        characteristic: &CharacteristicId,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.require_link()?;
        let mut state = self.state.lock().unwrap();
        if state.drop_link_on_read == Some(*characteristic) {
            state.drop_link_on_read = None;
            state.connected = false;
            return Err(TransportError::Connection("link supervision timeout".into()));
        }
        if let Some(err) = state
            .read_failures
            .get_mut(characteristic)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        state
            .values
            .get(characteristic)
            .cloned()
            .ok_or(TransportError::NotFound(*characteristic))
    }

    async fn write(
        &self,
        _handle: &DeviceHandle,
        characteristic: &CharacteristicId,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.require_link()?;
        let mut state = self.state.lock().unwrap();
        if !state.services.contains(characteristic) {
            return Err(TransportError::NotFound(*characteristic));
        }
        if let Some(err) = state
            .write_failures
            .get_mut(characteristic)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        state.values.insert(*characteristic, data.to_vec());
        state.written.push((*characteristic, data.to_vec()));
        Ok(())
    }

    async fn subscribe(
        &self,
        _handle: &DeviceHandle,
        characteristic: &CharacteristicId,
        sink: NotificationSink,
    ) -> Result<(), TransportError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().unwrap().subscribe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.require_link()?;
        let mut state = self.state.lock().unwrap();
        if let Some(current) = state.on_subscribe.get(characteristic) {
            sink.deliver(current.clone());
        }
        let script = state
            .notifications
            .get(characteristic)
            .cloned()
            .unwrap_or_default();
        let task = tokio::spawn(async move {
            for (delay, payload) in script {
                tokio::time::sleep(delay).await;
                sink.deliver(payload);
            }
        });
        if let Some(previous) = state.notifiers.insert(*characteristic, task) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        _handle: &DeviceHandle,
        characteristic: &CharacteristicId,
    ) -> Result<(), TransportError> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.state.lock().unwrap().notifiers.remove(characteristic) {
            task.abort();
        }
        Ok(())
    }

    async fn is_connected(&self, _handle: &DeviceHandle) -> bool {
        self.state.lock().unwrap().connected
    }
}
