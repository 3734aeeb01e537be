//! Collaborator interfaces to the host controller hardware
//!
//! The control plane never touches registers or rings directly. It issues
//! commands through [`CommandExecutor`], reads and acknowledges port state
//! through [`PortRegisters`], hands batches to the hardware through an
//! optional [`ScheduleHook`], and exposes enumerated devices to the rest of
//! the system through [`DevicePublisher`].

use crate::batch::TransferBatch;
use crate::device::DeviceInfo;
use crate::port::{PortChange, PortStatus};
use protocol::{SpeedClass, UsbAddress};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Controller-assigned device slot, distinct from the USB address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u8);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Root hub port number (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId(pub u8);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hardware command failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("command timed out")]
    Timeout,

    #[error("no device slots available")]
    NoSlotsAvailable,

    #[error("controller reported completion code {0}")]
    CompletionCode(u8),

    #[error("controller is halted")]
    Halted,
}

/// Default control endpoint parameters passed with ADDRESS DEVICE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultEndpointConfig {
    pub max_packet_size: u16,
    pub max_burst: u8,
    pub interval: u8,
    /// Retry count before the controller halts the endpoint
    pub error_count: u8,
}

impl DefaultEndpointConfig {
    pub const DEFAULT_ERROR_COUNT: u8 = 3;

    pub fn for_max_packet_size(max_packet_size: u16) -> Self {
        Self {
            max_packet_size,
            max_burst: 0,
            interval: 0,
            error_count: Self::DEFAULT_ERROR_COUNT,
        }
    }
}

/// Bandwidth available per root hub port, as reported by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthTable {
    available: Vec<u64>,
}

impl BandwidthTable {
    /// `available[i]` is the bandwidth of port `i + 1`
    pub fn new(available: Vec<u64>) -> Self {
        Self { available }
    }

    pub fn uniform(ports: u8, bandwidth: u64) -> Self {
        Self::new(vec![bandwidth; usize::from(ports)])
    }

    /// Available bandwidth on `port`; ports outside the table have none
    pub fn available(&self, port: PortId) -> u64 {
        usize::from(port.0)
            .checked_sub(1)
            .and_then(|i| self.available.get(i))
            .copied()
            .unwrap_or(0)
    }
}

/// Controller command interface
///
/// Every command may fail; failures are reported to the caller and never
/// retried by the control plane.
pub trait CommandExecutor: Send + Sync {
    /// ENABLE SLOT
    fn allocate_slot(&self) -> impl Future<Output = Result<SlotId, CommandError>> + Send;

    /// ADDRESS DEVICE with the default control endpoint configuration
    fn address_device(
        &self,
        slot: SlotId,
        port: PortId,
        ep0: &DefaultEndpointConfig,
    ) -> impl Future<Output = Result<UsbAddress, CommandError>> + Send;

    /// CONFIGURE ENDPOINT with the deconfigure flag set
    fn deconfigure(&self, slot: SlotId) -> impl Future<Output = Result<(), CommandError>> + Send;

    /// DISABLE SLOT
    fn disable_slot(&self, slot: SlotId) -> impl Future<Output = Result<(), CommandError>> + Send;

    /// GET PORT BANDWIDTH for the speed class of the device in `slot`
    fn query_bandwidth(
        &self,
        slot: SlotId,
        speed: SpeedClass,
    ) -> impl Future<Output = Result<BandwidthTable, CommandError>> + Send;

    /// Transfer scheduling hook, if the controller implements one
    fn schedule_hook(&self) -> Option<&dyn ScheduleHook> {
        None
    }
}

/// Hands batches to the hardware
pub trait ScheduleHook: Send + Sync {
    /// Queue `batch` on the hardware
    ///
    /// Must not block. The outcome is reported later through
    /// [`TransferBatch::complete`].
    fn schedule(&self, batch: Arc<TransferBatch>) -> Result<(), CommandError>;

    /// Remove `batch` from the hardware queue
    ///
    /// Called before an abort delivers the batch's completion, so that the
    /// hardware no longer touches the buffer.
    fn cancel(&self, batch: &TransferBatch) -> Result<(), CommandError> {
        let _ = batch;
        Ok(())
    }
}

/// Root hub port status registers
pub trait PortRegisters: Send + Sync {
    fn max_ports(&self) -> u8;

    /// Snapshot of the port's status and pending change bits
    fn read_port(&self, port: PortId) -> PortStatus;

    /// Acknowledge change bits (write-1-to-clear)
    fn clear_changes(&self, port: PortId, changes: PortChange);

    /// Start a port reset; completion raises the port-reset change bit
    fn reset_port(&self, port: PortId);
}

/// Publisher failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PublishError(pub String);

/// Makes enumerated devices visible to the rest of the system
pub trait DevicePublisher: Send + Sync {
    /// Name fixed by the platform for devices on `port`
    fn assigned_name(&self, port: PortId) -> Option<String> {
        let _ = port;
        None
    }

    fn publish(&self, device: &DeviceInfo) -> Result<(), PublishError>;

    fn unpublish(&self, device: &DeviceInfo) -> Result<(), PublishError>;
}

/// Everything a root hub needs from its controller
pub trait HostController: CommandExecutor + PortRegisters + DevicePublisher + 'static {}

impl<T> HostController for T where T: CommandExecutor + PortRegisters + DevicePublisher + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoint_config() {
        let config = DefaultEndpointConfig::for_max_packet_size(512);
        assert_eq!(config.max_packet_size, 512);
        assert_eq!(config.max_burst, 0);
        assert_eq!(config.interval, 0);
        assert_eq!(config.error_count, 3);
    }

    #[test]
    fn test_bandwidth_table_lookup() {
        let table = BandwidthTable::new(vec![100, 200, 300]);
        assert_eq!(table.available(PortId(1)), 100);
        assert_eq!(table.available(PortId(3)), 300);
        assert_eq!(table.available(PortId(0)), 0);
        assert_eq!(table.available(PortId(4)), 0);
    }
}
