//! Protocol types for the USB host stack
//!
//! This crate defines the USB protocol-level values shared by the host
//! control plane and its collaborators: speeds and port speed classes,
//! endpoint directions and transfer types, SETUP packets with their toggle
//! reset side effects, the device descriptor header used to size the default
//! control endpoint, and the completion codes delivered to transfer
//! submitters.
//!
//! # Example
//!
//! ```
//! use protocol::{SetupPacket, ToggleReset};
//!
//! let setup = SetupPacket::set_configuration(1);
//! let decoded = SetupPacket::from_bytes(&setup.to_bytes()).unwrap();
//! assert_eq!(decoded.toggle_reset(), ToggleReset::All);
//! ```

pub mod descriptor;
pub mod error;
pub mod setup;
pub mod types;

pub use descriptor::{DEVICE_DESCRIPTOR_HEADER_SIZE, DEVICE_DESCRIPTOR_SIZE, DeviceDescriptorHeader};
pub use error::{ProtocolError, Result};
pub use setup::{SETUP_PACKET_SIZE, SetupPacket, ToggleReset, descriptor_type, request};
pub use types::{
    DeviceSpeed, Direction, PortSpeed, SpeedClass, TransferType, UsbAddress, UsbError,
};
