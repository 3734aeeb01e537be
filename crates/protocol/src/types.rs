//! USB protocol type definitions
//!
//! Value types shared by the port monitor, the endpoint registry and the
//! transfer scheduler: speeds, directions, transfer types, addresses and the
//! completion codes reported back to transfer submitters.

use serde::{Deserialize, Serialize};
use std::fmt;

/// USB address assigned to a device by the controller during addressing
///
/// Distinct from the controller's slot identifier. Valid wire addresses are
/// 1..=127; 0 is the default address of an unaddressed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbAddress(pub u8);

impl fmt::Display for UsbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceSpeed {
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

impl DeviceSpeed {
    /// Single letter used in default device names (`usb5-hs`)
    pub fn letter(&self) -> char {
        match self {
            Self::Low => 'l',
            Self::Full => 'f',
            Self::High => 'h',
            Self::Super => 's',
            Self::SuperPlus => 'p',
        }
    }

    /// Speed class (major.minor protocol revision) a port reports for this speed
    pub fn class(&self) -> SpeedClass {
        match self {
            Self::Low | Self::Full | Self::High => SpeedClass::new(2, 0),
            Self::Super => SpeedClass::new(3, 0),
            Self::SuperPlus => SpeedClass::new(3, 1),
        }
    }
}

impl fmt::Display for DeviceSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Full => "full",
            Self::High => "high",
            Self::Super => "super",
            Self::SuperPlus => "super-plus",
        };
        write!(f, "{}", name)
    }
}

/// Protocol revision a root hub port speaks (USB2 vs USB3 class)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpeedClass {
    pub major: u8,
    pub minor: u8,
}

impl SpeedClass {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// USB3-class ports advance to the enabled link state on their own and
    /// need no port reset before addressing.
    pub fn is_usb3(&self) -> bool {
        self.major == 3
    }
}

impl fmt::Display for SpeedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "USB{}.{}", self.major, self.minor)
    }
}

/// Speed information read from a port: the class plus the concrete speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpeed {
    pub class: SpeedClass,
    pub speed: DeviceSpeed,
}

impl PortSpeed {
    pub fn new(speed: DeviceSpeed) -> Self {
        Self {
            class: speed.class(),
            speed,
        }
    }

    pub fn is_usb3(&self) -> bool {
        self.class.is_usb3()
    }
}

impl fmt::Display for PortSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}-speed)", self.class, self.speed)
    }
}

/// Endpoint / transfer direction
///
/// Control endpoints are bidirectional and registered as `Both`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
    Both,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => write!(f, "IN"),
            Self::Out => write!(f, "OUT"),
            Self::Both => write!(f, "BOTH"),
        }
    }
}

/// USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

impl TransferType {
    /// Short tag used in log lines
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Control => "CTRL",
            Self::Bulk => "BULK",
            Self::Interrupt => "INTR",
            Self::Isochronous => "ISOC",
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Control => "Control",
            Self::Bulk => "Bulk",
            Self::Interrupt => "Interrupt",
            Self::Isochronous => "Isochronous",
        };
        write!(f, "{}", name)
    }
}

/// Completion codes carried by a transfer's completion record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsbError {
    /// Transfer was cancelled before the controller finished it
    /// (explicit abort or device teardown)
    Aborted,
    /// Transfer timed out
    Timeout,
    /// Endpoint stalled (protocol error)
    Stall,
    /// Device was disconnected
    NoDevice,
    /// Device sent more data than the buffer could hold
    Babble,
    /// Data buffer overrun / underrun in the controller
    DataBuffer,
    /// Transaction error (CRC, timeout at the wire level)
    Transaction,
    /// Other controller completion code
    Other { code: u8 },
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => write!(f, "transfer aborted"),
            Self::Timeout => write!(f, "transfer timed out"),
            Self::Stall => write!(f, "endpoint stalled"),
            Self::NoDevice => write!(f, "device disconnected"),
            Self::Babble => write!(f, "babble detected"),
            Self::DataBuffer => write!(f, "data buffer error"),
            Self::Transaction => write!(f, "transaction error"),
            Self::Other { code } => write!(f, "completion code {}", code),
        }
    }
}

impl std::error::Error for UsbError {}
