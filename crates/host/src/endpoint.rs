//! Endpoints and their bandwidth accounting

use crate::batch::TransferBatch;
use crate::device::{Device, DeviceId};
use protocol::{Direction, PortSpeed, TransferType};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Default control endpoint packet size on USB3 ports
pub const USB3_CONTROL_MAX_PACKET_SIZE: u16 = 512;

/// Default control endpoint packet size before the real one is negotiated
pub const MIN_CONTROL_MAX_PACKET_SIZE: u16 = 8;

/// Default control endpoint packet size for a device on a port of `speed`
pub fn default_control_max_packet_size(speed: &PortSpeed) -> u16 {
    if speed.is_usb3() {
        USB3_CONTROL_MAX_PACKET_SIZE
    } else {
        MIN_CONTROL_MAX_PACKET_SIZE
    }
}

/// Bandwidth a transfer of `size` bytes needs on an endpoint
///
/// Control transfers are not accounted; other types need the size rounded
/// up to whole packets.
pub fn bandwidth_for(transfer_type: TransferType, size: usize, max_packet_size: u16) -> u64 {
    if transfer_type == TransferType::Control {
        return 0;
    }
    let size = size as u64;
    match u64::from(max_packet_size) {
        0 => size,
        mps => size.div_ceil(mps) * mps,
    }
}

/// Lock a std mutex, ignoring poisoning
///
/// The data guarded by these locks stays consistent when a completion
/// callback panics, since callbacks run outside them.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a caller asks the registry to create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub number: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    /// Packets per service interval reserved for this endpoint
    pub packets: u32,
}

impl EndpointDescriptor {
    /// Default control endpoint with the packet size implied by `speed`
    pub fn default_control(speed: &PortSpeed) -> Self {
        Self::control(default_control_max_packet_size(speed))
    }

    pub fn control(max_packet_size: u16) -> Self {
        Self {
            number: 0,
            direction: Direction::Both,
            transfer_type: TransferType::Control,
            max_packet_size,
            packets: 1,
        }
    }

    pub fn bulk(number: u8, direction: Direction, max_packet_size: u16, packets: u32) -> Self {
        Self {
            number,
            direction,
            transfer_type: TransferType::Bulk,
            max_packet_size,
            packets,
        }
    }

    pub fn interrupt(number: u8, direction: Direction, max_packet_size: u16) -> Self {
        Self {
            number,
            direction,
            transfer_type: TransferType::Interrupt,
            max_packet_size,
            packets: 1,
        }
    }

    pub fn isochronous(
        number: u8,
        direction: Direction,
        max_packet_size: u16,
        packets: u32,
    ) -> Self {
        Self {
            number,
            direction,
            transfer_type: TransferType::Isochronous,
            max_packet_size,
            packets,
        }
    }

    /// Bandwidth reserved at registration
    pub fn reservation(&self) -> u64 {
        let bytes = u64::from(self.packets) * u64::from(self.max_packet_size);
        bandwidth_for(
            self.transfer_type,
            usize::try_from(bytes).unwrap_or(usize::MAX),
            self.max_packet_size,
        )
    }
}

/// A registered endpoint
///
/// Shared between the owning device's slot table, the registry and any
/// in-flight batch. Holds only a weak link back to the device so that
/// dropping the device is never blocked by its endpoints.
pub struct Endpoint {
    device: Weak<Device>,
    device_id: DeviceId,
    number: u8,
    direction: Direction,
    transfer_type: TransferType,
    max_packet_size: u16,
    bandwidth: u64,
    active: Mutex<Option<Arc<TransferBatch>>>,
}

impl Endpoint {
    pub(crate) fn new(
        device: &Arc<Device>,
        descriptor: &EndpointDescriptor,
        bandwidth: u64,
    ) -> Self {
        Self {
            device: Arc::downgrade(device),
            device_id: device.id(),
            number: descriptor.number,
            direction: descriptor.direction,
            transfer_type: descriptor.transfer_type,
            max_packet_size: descriptor.max_packet_size,
            bandwidth,
            active: Mutex::new(None),
        }
    }

    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    /// Bandwidth reserved for this endpoint
    pub fn bandwidth(&self) -> u64 {
        self.bandwidth
    }

    /// The batch currently outstanding on this endpoint, if any
    pub fn active_batch(&self) -> Option<Arc<TransferBatch>> {
        lock_unpoisoned(&self.active).clone()
    }

    pub fn is_active(&self) -> bool {
        lock_unpoisoned(&self.active).is_some()
    }

    pub(crate) fn lock_active(&self) -> MutexGuard<'_, Option<Arc<TransferBatch>>> {
        lock_unpoisoned(&self.active)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("device", &self.device_id)
            .field("number", &self.number)
            .field("direction", &self.direction)
            .field("transfer_type", &self.transfer_type)
            .field("max_packet_size", &self.max_packet_size)
            .field("bandwidth", &self.bandwidth)
            .finish_non_exhaustive()
    }
}
