//! [`Transport`] backed by the host Bluetooth stack through `btleplug`.
//!
//! Targets are resolved by scanning on the first adapter until a peripheral
//! with the requested address or advertised name shows up. Notification
//! delivery runs on one spawned task per subscribed characteristic.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    CharacteristicId, CharacteristicProps, ConnectTarget, DeviceHandle, NotificationSink, ServiceMap,
    Transport, TransportError,
};

const SCAN_POLL: Duration = Duration::from_millis(250);

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected | btleplug::Error::DeviceNotFound => {
                TransportError::Connection(e.to_string())
            }
            btleplug::Error::TimedOut(d) => TransportError::Timeout(d),
            other => TransportError::Link(other.to_string()),
        }
    }
}

struct Connected {
    peripheral: Peripheral,
    notifiers: HashMap<CharacteristicId, JoinHandle<()>>,
}

pub struct BtleplugTransport {
    adapter: Adapter,
    scan_timeout: Duration,
    devices: Mutex<HashMap<String, Connected>>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter on the host.
    pub async fn new(scan_timeout: Duration) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Connection("no Bluetooth adapter found".into()))?;
        if let Ok(info) = adapter.adapter_info().await {
            info!(adapter = %info, "using Bluetooth adapter");
        }
        Ok(Self {
            adapter,
            scan_timeout,
            devices: Mutex::new(HashMap::new()),
        })
    }

    async fn matches(peripheral: &Peripheral, target: &ConnectTarget) -> bool {
        let props = match peripheral.properties().await {
            Ok(Some(props)) => props,
            _ => return false,
        };
        match target {
            ConnectTarget::Address(address) => {
                props.address.to_string().eq_ignore_ascii_case(address)
                    || format!("{:?}", peripheral.id()).contains(address.as_str())
            }
            ConnectTarget::Name(name) => props.local_name.as_deref() == Some(name.as_str()),
        }
    }

    async fn scan_for(&self, target: &ConnectTarget) -> Result<Peripheral, TransportError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        let deadline = Instant::now() + self.scan_timeout;
        debug!(%target, timeout = ?self.scan_timeout, "scanning");

        let found = loop {
            let mut hit = None;
            for peripheral in self.adapter.peripherals().await? {
                if Self::matches(&peripheral, target).await {
                    hit = Some(peripheral);
                    break;
                }
            }
            if hit.is_some() || Instant::now() >= deadline {
                break hit;
            }
            tokio::time::sleep(SCAN_POLL).await;
        };

        if let Err(e) = self.adapter.stop_scan().await {
            warn!(error = %e, "failed to stop scan");
        }
        found.ok_or_else(|| {
            TransportError::Connection(format!("no device with {} found within {:?}", target, self.scan_timeout))
        })
    }

    async fn peripheral(&self, handle: &DeviceHandle) -> Result<Peripheral, TransportError> {
        self.devices
            .lock()
            .await
            .get(handle.id())
            .map(|c| c.peripheral.clone())
            .ok_or_else(|| TransportError::Connection(format!("device {} is not connected", handle.id())))
    }

    async fn characteristic(
        &self,
        handle: &DeviceHandle,
        id: &CharacteristicId,
    ) -> Result<(Peripheral, Characteristic), TransportError> {
        let peripheral = self.peripheral(handle).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == id.uuid())
            .ok_or(TransportError::NotFound(*id))?;
        Ok((peripheral, characteristic))
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn connect(&self, target: &ConnectTarget) -> Result<DeviceHandle, TransportError> {
        let peripheral = self.scan_for(target).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let id = format!("{:?}", peripheral.id());
        info!(device = %id, %target, "connected");
        self.devices.lock().await.insert(
            id.clone(),
            Connected {
                peripheral,
                notifiers: HashMap::new(),
            },
        );
        Ok(DeviceHandle::connected(id, target.clone()))
    }

    async fn disconnect(&self, handle: &DeviceHandle) -> Result<(), TransportError> {
        let Some(connected) = self.devices.lock().await.remove(handle.id()) else {
            debug!(device = handle.id(), "disconnect: not connected");
            return Ok(());
        };
        for (_, task) in connected.notifiers {
            task.abort();
        }
        if connected.peripheral.is_connected().await.unwrap_or(false) {
            connected.peripheral.disconnect().await?;
        }
        info!(device = handle.id(), "disconnected");
        Ok(())
    }

    async fn discover(&self, handle: &DeviceHandle) -> Result<ServiceMap, TransportError> {
        let peripheral = self.peripheral(handle).await?;
        peripheral.discover_services().await?;

        let mut map = ServiceMap::new();
        for service in peripheral.services() {
            for c in &service.characteristics {
                let flags = c.properties;
                map.insert(
                    service.uuid,
                    CharacteristicId::from_uuid(c.uuid),
                    CharacteristicProps {
                        read: flags.contains(CharPropFlags::READ),
                        write: flags.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
                        notify: flags.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
                    },
                );
            }
        }
        Ok(map)
    }

    async fn read(
        &self,
        handle: &DeviceHandle,
        characteristic: &CharacteristicId,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let (peripheral, c) = self.characteristic(handle, characteristic).await?;
        tokio::time::timeout(timeout, peripheral.read(&c))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(TransportError::from)
    }

    async fn write(
        &self,
        handle: &DeviceHandle,
        characteristic: &CharacteristicId,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let (peripheral, c) = self.characteristic(handle, characteristic).await?;
        let write_type = if c.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        tokio::time::timeout(timeout, peripheral.write(&c, data, write_type))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(TransportError::from)
    }

    async fn subscribe(
        &self,
        handle: &DeviceHandle,
        characteristic: &CharacteristicId,
        sink: NotificationSink,
    ) -> Result<(), TransportError> {
        let (peripheral, c) = self.characteristic(handle, characteristic).await?;
        let mut stream = peripheral.notifications().await?;
        peripheral.subscribe(&c).await?;

        // Forwarder is spawned and recorded with no await in between.
        let mut devices = self.devices.lock().await;
        let Some(connected) = devices.get_mut(handle.id()) else {
            return Err(TransportError::Connection(format!("device {} is not connected", handle.id())));
        };
        let uuid = c.uuid;
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if sink.is_closed() {
                    break;
                }
                if notification.uuid == uuid {
                    sink.deliver(notification.value);
                }
            }
        });
        if let Some(previous) = connected.notifiers.insert(*characteristic, task) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        handle: &DeviceHandle,
        characteristic: &CharacteristicId,
    ) -> Result<(), TransportError> {
        if let Some(connected) = self.devices.lock().await.get_mut(handle.id()) {
            if let Some(task) = connected.notifiers.remove(characteristic) {
                task.abort();
            }
        }
        let (peripheral, c) = self.characteristic(handle, characteristic).await?;
        peripheral.unsubscribe(&c).await?;
        Ok(())
    }

    async fn is_connected(&self, handle: &DeviceHandle) -> bool {
        match self.peripheral(handle).await {
            Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }
}
