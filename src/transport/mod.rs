//! Transport adapter: the capability-typed boundary to a BLE stack.
//!
//! The harness never speaks GATT itself. Everything it does to a device goes
//! through [`Transport`], which a backend (btleplug, or a scripted double in
//! tests) implements. Operations on one [`DeviceHandle`] are expected to be
//! linearized by the backend.

#[cfg(feature = "btleplug")]
pub mod btleplug;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("characteristic {0} not found")]
    NotFound(CharacteristicId),

    #[error("link error: {0}")]
    Link(String),
}

impl TransportError {
    /// Whether an interaction primitive may retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Link(_))
    }
}

// ---------------------------------------------------------------------------
// Characteristic identifiers
// ---------------------------------------------------------------------------

/// Bluetooth SIG base UUID, used to expand 16- and 32-bit short forms.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// A GATT characteristic UUID.
///
/// Parses full UUIDs as well as the short `2a19` / `0000180f` forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CharacteristicId(Uuid);

impl CharacteristicId {
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Expand a 16- or 32-bit assigned number onto the Bluetooth base UUID.
    pub const fn from_short(short: u32) -> Self {
        Self(Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96)))
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl FromStr for CharacteristicId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().trim_start_matches("0x");
        if raw.len() == 4 || raw.len() == 8 {
            return u32::from_str_radix(raw, 16)
                .map(Self::from_short)
                .map_err(|e| format!("invalid short characteristic id '{}': {}", s, e));
        }
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|e| format!("invalid characteristic id '{}': {}", s, e))
    }
}

impl TryFrom<String> for CharacteristicId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CharacteristicId> for String {
    fn from(id: CharacteristicId) -> Self {
        id.to_string()
    }
}

impl From<Uuid> for CharacteristicId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

// ---------------------------------------------------------------------------
// Device handle
// ---------------------------------------------------------------------------

/// How the device to test is addressed. Resolution (scan, interactive pick)
/// happens outside the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectTarget {
    /// Platform identifier: MAC address on Linux/Windows, UUID on macOS.
    Address(String),
    /// Advertised local name.
    Name(String),
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectTarget::Address(a) => write!(f, "address {}", a),
            ConnectTarget::Name(n) => write!(f, "name '{}'", n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

/// Opaque identifier of a device plus the harness' view of its link state.
///
/// Owned by the execution engine for the whole run; tests only ever see it
/// through a shared reference held by their context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    id: String,
    target: ConnectTarget,
    state: ConnectionState,
}

impl DeviceHandle {
    /// A handle for a freshly established link.
    pub fn connected(id: impl Into<String>, target: ConnectTarget) -> Self {
        Self {
            id: id.into(),
            target,
            state: ConnectionState::Connected,
        }
    }

    /// A handle for a target that never produced a link. Backends must
    /// treat disconnecting it as a no-op.
    pub fn detached(target: ConnectTarget) -> Self {
        let id = match &target {
            ConnectTarget::Address(a) => a.clone(),
            ConnectTarget::Name(n) => n.clone(),
        };
        Self {
            id,
            target,
            state: ConnectionState::Failed,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        trace!(device = %self.id, from = ?self.state, to = ?state, "device state");
        self.state = state;
    }
}

// ---------------------------------------------------------------------------
// GATT layout
// ---------------------------------------------------------------------------

/// Properties advertised for a characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProps {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

/// Discovered services: service UUID -> characteristic UUID -> properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceMap {
    services: BTreeMap<Uuid, BTreeMap<CharacteristicId, CharacteristicProps>>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: Uuid, characteristic: CharacteristicId, props: CharacteristicProps) {
        self.services
            .entry(service)
            .or_default()
            .insert(characteristic, props);
    }

    pub fn contains(&self, characteristic: &CharacteristicId) -> bool {
        self.properties(characteristic).is_some()
    }

    pub fn properties(&self, characteristic: &CharacteristicId) -> Option<CharacteristicProps> {
        self.services
            .values()
            .find_map(|chars| chars.get(characteristic).copied())
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn characteristic_count(&self) -> usize {
        self.services.values().map(BTreeMap::len).sum()
    }
}

// ---------------------------------------------------------------------------
// Notification delivery
// ---------------------------------------------------------------------------

/// Backend-facing end of a subscription.
///
/// Backends push each notification payload here in the order the device
/// emitted it. Payloads pushed while nobody is waiting on the subscription
/// are dropped on the floor: missed notifications are never buffered across
/// waits.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    listening: Arc<AtomicBool>,
}

impl NotificationSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Vec<u8>>, listening: Arc<AtomicBool>) -> Self {
        Self { tx, listening }
    }

    /// Deliver one payload. Returns `false` when it was dropped, either
    /// because no wait is pending or the subscription is gone.
    pub fn deliver(&self, payload: Vec<u8>) -> bool {
        if !self.listening.load(Ordering::Acquire) {
            trace!(len = payload.len(), "notification dropped: no pending wait");
            return false;
        }
        self.tx.send(payload).is_ok()
    }

    /// Whether the consuming subscription has been released.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ---------------------------------------------------------------------------
// The adapter trait
// ---------------------------------------------------------------------------

/// Capability set a BLE backend must provide.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a link to the target.
    async fn connect(&self, target: &ConnectTarget) -> Result<DeviceHandle, TransportError>;

    /// Tear the link down. Must be idempotent and accept detached handles.
    async fn disconnect(&self, handle: &DeviceHandle) -> Result<(), TransportError>;

    /// Enumerate services and characteristics.
    async fn discover(&self, handle: &DeviceHandle) -> Result<ServiceMap, TransportError>;

    async fn read(
        &self,
        handle: &DeviceHandle,
        characteristic: &CharacteristicId,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    async fn write(
        &self,
        handle: &DeviceHandle,
        characteristic: &CharacteristicId,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Start pushing notifications for `characteristic` into `sink` until
    /// [`Transport::unsubscribe`] is called.
    async fn subscribe(
        &self,
        handle: &DeviceHandle,
        characteristic: &CharacteristicId,
        sink: NotificationSink,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(
        &self,
        handle: &DeviceHandle,
        characteristic: &CharacteristicId,
    ) -> Result<(), TransportError>;

    /// Live link state as seen by the backend.
    async fn is_connected(&self, handle: &DeviceHandle) -> bool;
}
