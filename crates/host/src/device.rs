//! Enumerated devices
//!
//! A [`Device`] is created when a port's device is being enumerated and lives
//! until its teardown finishes. Its identity (port, slot, speed) is fixed at
//! creation; the USB address and name are set once during enumeration. The
//! online flag and the endpoint slots are guarded by the device lock.

use crate::controller::{PortId, SlotId};
use crate::endpoint::Endpoint;
use protocol::{Direction, PortSpeed, UsbAddress};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, MutexGuard};

/// Endpoint contexts per device (the default control endpoint plus 15 IN and
/// 15 OUT endpoints)
pub const MAX_ENDPOINTS: usize = 31;

/// Highest non-default endpoint number
pub const MAX_ENDPOINT_NUMBER: u8 = 15;

/// Host-side device identifier, unique for the life of a root hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Endpoint slot of `number`/`direction` within a device
///
/// Slot 0 is the bidirectional default control endpoint; endpoint N takes
/// slot 2N-1 for OUT (or bidirectional) and 2N for IN.
pub fn endpoint_index(number: u8, direction: Direction) -> Option<usize> {
    match (number, direction) {
        (0, _) => Some(0),
        (n, _) if n > MAX_ENDPOINT_NUMBER => None,
        (n, Direction::In) => Some(2 * usize::from(n)),
        (n, Direction::Out | Direction::Both) => Some(2 * usize::from(n) - 1),
    }
}

/// Name used when the platform assigns none, e.g. `usb5-ss`
pub fn default_device_name(address: UsbAddress, speed: &PortSpeed) -> String {
    format!("usb{}-{}s", address.0, speed.speed.letter())
}

pub(crate) struct DeviceState {
    pub(crate) online: bool,
    pub(crate) endpoints: [Option<Arc<Endpoint>>; MAX_ENDPOINTS],
}

impl DeviceState {
    /// Whether `endpoint` still occupies its slot in this device
    pub(crate) fn holds(&self, endpoint: &Arc<Endpoint>) -> bool {
        endpoint_index(endpoint.number(), endpoint.direction())
            .and_then(|i| self.endpoints[i].as_ref())
            .is_some_and(|held| Arc::ptr_eq(held, endpoint))
    }
}

pub struct Device {
    id: DeviceId,
    port: PortId,
    slot: SlotId,
    speed: PortSpeed,
    address: OnceLock<UsbAddress>,
    name: OnceLock<String>,
    published: AtomicBool,
    state: Mutex<DeviceState>,
}

impl Device {
    /// New device, offline and without endpoints
    pub(crate) fn new(id: DeviceId, port: PortId, slot: SlotId, speed: PortSpeed) -> Self {
        Self {
            id,
            port,
            slot,
            speed,
            address: OnceLock::new(),
            name: OnceLock::new(),
            published: AtomicBool::new(false),
            state: Mutex::new(DeviceState {
                online: false,
                endpoints: std::array::from_fn(|_| None),
            }),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn speed(&self) -> PortSpeed {
        self.speed
    }

    /// USB address, once the device has been addressed
    pub fn address(&self) -> Option<UsbAddress> {
        self.address.get().copied()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    /// Name for log lines: the published name, or the slot before naming
    pub fn display_name(&self) -> String {
        match self.name() {
            Some(name) => name.to_string(),
            None => format!("slot {}", self.slot),
        }
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    pub async fn is_online(&self) -> bool {
        self.state.lock().await.online
    }

    /// Endpoint occupying the slot of `number`/`direction`
    pub async fn endpoint(&self, number: u8, direction: Direction) -> Option<Arc<Endpoint>> {
        let index = endpoint_index(number, direction)?;
        self.state.lock().await.endpoints[index].clone()
    }

    /// All registered endpoints, in slot order
    pub async fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.state.lock().await.endpoints.iter().flatten().cloned().collect()
    }

    /// Serializable snapshot
    pub async fn info(&self) -> DeviceInfo {
        let state = self.state.lock().await;
        DeviceInfo {
            id: self.id,
            port: self.port,
            slot: self.slot,
            speed: self.speed,
            address: self.address(),
            name: self.name.get().cloned(),
            online: state.online,
            endpoints: state.endpoints.iter().flatten().count(),
        }
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().await
    }

    pub(crate) fn set_address(&self, address: UsbAddress) {
        let _ = self.address.set(address);
    }

    pub(crate) fn set_name(&self, name: String) {
        let _ = self.name.set(name);
    }

    pub(crate) fn mark_published(&self) {
        self.published.store(true, Ordering::Release);
    }

    pub(crate) async fn set_online(&self, online: bool) {
        self.state.lock().await.online = online;
    }

    /// Empty every endpoint slot, returning what was registered
    pub(crate) async fn take_endpoints(&self) -> Vec<Arc<Endpoint>> {
        let mut state = self.state.lock().await;
        state.endpoints.iter_mut().filter_map(Option::take).collect()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("slot", &self.slot)
            .field("speed", &self.speed)
            .field("address", &self.address())
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Snapshot of a device, handed to publishers and printed by the CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub port: PortId,
    pub slot: SlotId,
    pub speed: PortSpeed,
    pub address: Option<UsbAddress>,
    pub name: Option<String>,
    pub online: bool,
    pub endpoints: usize,
}
