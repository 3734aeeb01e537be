//! Root hub port state as read from the port status registers

use protocol::PortSpeed;
use std::fmt;

bitflags::bitflags! {
    /// Pending change bits of a port status register
    ///
    /// Bit positions follow the xHCI PORTSC layout. Bits outside the known
    /// set are retained so they can be reported as ignored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PortChange: u32 {
        /// CSC
        const CONNECT_STATUS = 1 << 17;
        /// PEC
        const PORT_ENABLED = 1 << 18;
        /// WRC
        const WARM_RESET = 1 << 19;
        /// OCC
        const OVER_CURRENT = 1 << 20;
        /// PRC
        const PORT_RESET = 1 << 21;
        /// PLC
        const LINK_STATE = 1 << 22;
        /// CEC
        const CONFIG_ERROR = 1 << 23;
    }
}

impl PortChange {
    /// Changes that are acknowledged and logged without further action
    pub const INFORMATIONAL: Self = Self::PORT_ENABLED
        .union(Self::WARM_RESET)
        .union(Self::OVER_CURRENT)
        .union(Self::LINK_STATE)
        .union(Self::CONFIG_ERROR);

    /// Set bits with no known meaning
    pub fn unrecognized(&self) -> u32 {
        self.bits() & !Self::all().bits()
    }
}

/// Port link state (PLS)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// U0
    Enabled,
    Disabled,
    Resetting,
    Polling,
    /// SS.Inactive, the link failed to train
    Inactive,
    Other(u8),
}

impl LinkState {
    /// Decode the raw PLS field
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Enabled,
            // RxDetect also means the link never came up
            4 | 5 => Self::Disabled,
            6 => Self::Inactive,
            7 => Self::Polling,
            // Hot and warm reset
            8 | 9 => Self::Resetting,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => write!(f, "enabled"),
            Self::Disabled => write!(f, "disabled"),
            Self::Resetting => write!(f, "resetting"),
            Self::Polling => write!(f, "polling"),
            Self::Inactive => write!(f, "inactive"),
            Self::Other(raw) => write!(f, "raw {}", raw),
        }
    }
}

/// Snapshot of one port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatus {
    pub connected: bool,
    pub link_state: LinkState,
    pub speed: PortSpeed,
    pub changes: PortChange,
}
