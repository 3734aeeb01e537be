//! Host control plane errors

use crate::batch::BatchId;
use crate::controller::{CommandError, PortId, PublishError};
use crate::device::DeviceId;
use crate::port::LinkState;
use protocol::{Direction, ProtocolError, UsbError};
use thiserror::Error;

/// Failure classes callers use to decide what to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Hardware command failed; a later port event may succeed
    Transient,
    /// Bandwidth or endpoint capacity exhausted; not retried
    ResourceExhaustion,
    /// Request or port state violates the protocol; not retried
    ProtocolViolation,
    /// Transfer completed with an error code
    Transfer,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("hardware command failed: {0}")]
    Command(#[from] CommandError),

    #[error("port {0} is out of range")]
    InvalidPort(PortId),

    #[error("port {0} already has a device")]
    PortOccupied(PortId),

    #[error("USB3 port {0} could not be enabled")]
    EnableFailed(PortId),

    #[error("port {port} is in invalid link state {state}")]
    InvalidLinkState { port: PortId, state: LinkState },

    #[error("device {0} is offline")]
    DeviceOffline(DeviceId),

    #[error("{number} is not a valid endpoint number")]
    InvalidEndpoint { number: u8 },

    #[error("endpoint {number} ({direction}) not registered on device {device}")]
    EndpointNotFound {
        device: DeviceId,
        number: u8,
        direction: Direction,
    },

    #[error("endpoint {number} ({direction}) already registered on device {device}")]
    EndpointOccupied {
        device: DeviceId,
        number: u8,
        direction: Direction,
    },

    #[error("endpoint {number} ({direction}) of device {device} already has an active transfer")]
    EndpointBusy {
        device: DeviceId,
        number: u8,
        direction: Direction,
    },

    #[error("transfer needs {needed} bandwidth but only {reserved} is reserved")]
    InsufficientBandwidth { needed: u64, reserved: u64 },

    #[error("bandwidth exhausted on port {port}: requested {requested}, available {available}")]
    BandwidthExhausted {
        port: PortId,
        requested: u64,
        available: u64,
    },

    #[error("bandwidth query failed: {0}")]
    BandwidthUnavailable(CommandError),

    #[error("controller does not implement transfer scheduling")]
    NotSupported,

    #[error("failed to publish device: {0}")]
    Publish(PublishError),

    #[error("invalid descriptor: {0}")]
    Descriptor(ProtocolError),

    #[error("transfer failed: {0}")]
    Transfer(UsbError),

    #[error("transfer timed out")]
    TimedOut,

    #[error("completion of batch {0} was lost")]
    CompletionLost(BatchId),
}

impl HostError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Command(_) | Self::EnableFailed(_) | Self::Publish(_) => ErrorClass::Transient,
            Self::PortOccupied(_)
            | Self::EndpointOccupied { .. }
            | Self::EndpointBusy { .. }
            | Self::InsufficientBandwidth { .. }
            | Self::BandwidthExhausted { .. }
            | Self::BandwidthUnavailable(_) => ErrorClass::ResourceExhaustion,
            Self::InvalidPort(_)
            | Self::InvalidLinkState { .. }
            | Self::DeviceOffline(_)
            | Self::InvalidEndpoint { .. }
            | Self::EndpointNotFound { .. }
            | Self::NotSupported
            | Self::Descriptor(_) => ErrorClass::ProtocolViolation,
            Self::Transfer(_) | Self::TimedOut | Self::CompletionLost(_) => ErrorClass::Transfer,
        }
    }

    /// Whether a later port event may succeed where this failed
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

pub type Result<T> = std::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            HostError::Command(CommandError::Timeout).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            HostError::BandwidthUnavailable(CommandError::Timeout).class(),
            ErrorClass::ResourceExhaustion
        );
        assert_eq!(
            HostError::InvalidLinkState {
                port: PortId(2),
                state: LinkState::Polling
            }
            .class(),
            ErrorClass::ProtocolViolation
        );
        assert_eq!(
            HostError::Transfer(UsbError::Aborted).class(),
            ErrorClass::Transfer
        );
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(HostError::EnableFailed(PortId(1)).is_retryable());
        assert!(!HostError::NotSupported.is_retryable());
        assert!(
            !HostError::InsufficientBandwidth {
                needed: 4096,
                reserved: 1024
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_display() {
        let err = HostError::EndpointNotFound {
            device: DeviceId(3),
            number: 1,
            direction: Direction::In,
        };
        assert_eq!(err.to_string(), "endpoint 1 (IN) not registered on device 3");
    }
}
