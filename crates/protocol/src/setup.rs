//! SETUP packet encoding for control transfers
//!
//! The 8-byte SETUP stage payload travels with every control transfer batch.
//! Besides carrying it to the controller, the scheduler derives the data
//! toggle reset policy from it: some standard requests implicitly reset the
//! toggle of one or all endpoints of the device.

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Size of a SETUP packet on the wire
pub const SETUP_PACKET_SIZE: usize = 8;

/// bmRequestType direction bit (device-to-host)
pub const REQUEST_TYPE_IN: u8 = 0x80;

/// Standard request codes (USB 2.0 table 9-4)
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
}

/// Descriptor types used with GET_DESCRIPTOR
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
}

/// Feature selector for CLEAR_FEATURE(ENDPOINT_HALT)
const FEATURE_ENDPOINT_HALT: u16 = 0x0000;

// Standard request, recipient device / interface / endpoint, host-to-device.
const REQUEST_TYPE_STD_DEVICE_OUT: u8 = 0x00;
const REQUEST_TYPE_STD_INTERFACE_OUT: u8 = 0x01;
const REQUEST_TYPE_STD_ENDPOINT_OUT: u8 = 0x02;
const REQUEST_TYPE_STD_DEVICE_IN: u8 = 0x80;

/// Which data toggles a control request resets once it completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ToggleReset {
    /// Request has no toggle side effect
    #[default]
    None,
    /// CLEAR_FEATURE(ENDPOINT_HALT) resets the addressed endpoint only
    Endpoint(u8),
    /// SET_CONFIGURATION / SET_INTERFACE reset every endpoint
    All,
}

/// Control transfer SETUP stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Decode a SETUP packet from its little-endian wire form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SETUP_PACKET_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: SETUP_PACKET_SIZE,
                available: bytes.len(),
            });
        }

        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        })
    }

    /// Encode into the 8-byte wire form
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_SIZE] {
        let mut bytes = [0u8; SETUP_PACKET_SIZE];
        bytes[0] = self.request_type;
        bytes[1] = self.request;
        LittleEndian::write_u16(&mut bytes[2..4], self.value);
        LittleEndian::write_u16(&mut bytes[4..6], self.index);
        LittleEndian::write_u16(&mut bytes[6..8], self.length);
        bytes
    }

    /// Unpack the packed 64-bit form some controllers store in the TRB
    /// immediate data field.
    pub fn from_packed(packed: u64) -> Self {
        let bytes = packed.to_le_bytes();
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        }
    }

    pub fn to_packed(&self) -> u64 {
        u64::from_le_bytes(self.to_bytes())
    }

    /// Whether the data stage (if any) flows device-to-host
    pub fn is_in(&self) -> bool {
        self.request_type & REQUEST_TYPE_IN != 0
    }

    /// GET_DESCRIPTOR for the given descriptor type and index
    pub fn get_descriptor(descriptor: u8, index: u8, length: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_STD_DEVICE_IN,
            request: request::GET_DESCRIPTOR,
            value: (u16::from(descriptor) << 8) | u16::from(index),
            index: 0,
            length,
        }
    }

    pub fn set_configuration(configuration: u8) -> Self {
        Self {
            request_type: REQUEST_TYPE_STD_DEVICE_OUT,
            request: request::SET_CONFIGURATION,
            value: u16::from(configuration),
            index: 0,
            length: 0,
        }
    }

    pub fn set_interface(interface: u16, alternate: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_STD_INTERFACE_OUT,
            request: request::SET_INTERFACE,
            value: alternate,
            index: interface,
            length: 0,
        }
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) addressed to `endpoint` (with direction bit)
    pub fn clear_endpoint_halt(endpoint: u8) -> Self {
        Self {
            request_type: REQUEST_TYPE_STD_ENDPOINT_OUT,
            request: request::CLEAR_FEATURE,
            value: FEATURE_ENDPOINT_HALT,
            index: u16::from(endpoint),
            length: 0,
        }
    }

    /// Toggle reset side effect of this request
    pub fn toggle_reset(&self) -> ToggleReset {
        match (self.request_type, self.request) {
            (REQUEST_TYPE_STD_ENDPOINT_OUT, request::CLEAR_FEATURE)
                if self.value == FEATURE_ENDPOINT_HALT =>
            {
                ToggleReset::Endpoint((self.index & 0xFF) as u8)
            }
            (REQUEST_TYPE_STD_DEVICE_OUT, request::SET_CONFIGURATION)
            | (REQUEST_TYPE_STD_INTERFACE_OUT, request::SET_INTERFACE) => ToggleReset::All,
            _ => ToggleReset::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_get_descriptor() {
        let bytes = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let setup = SetupPacket::from_bytes(&bytes).unwrap();
        assert_eq!(setup, SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, 18));
        assert!(setup.is_in());
    }

    #[test]
    fn test_short_buffer_rejected() {
        let err = SetupPacket::from_bytes(&[0x80, 0x06]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BufferTooSmall {
                needed: 8,
                available: 2
            }
        ));
    }

    #[test]
    fn test_packed_form_is_wire_order() {
        let setup = SetupPacket::set_configuration(1);
        assert_eq!(setup.to_packed() & 0xFF, 0x00);
        assert_eq!((setup.to_packed() >> 8) & 0xFF, 0x09);
        assert_eq!(SetupPacket::from_packed(setup.to_packed()), setup);
    }

    #[test]
    fn test_toggle_reset_policy() {
        assert_eq!(
            SetupPacket::clear_endpoint_halt(0x81).toggle_reset(),
            ToggleReset::Endpoint(0x81)
        );
        assert_eq!(SetupPacket::set_configuration(1).toggle_reset(), ToggleReset::All);
        assert_eq!(SetupPacket::set_interface(0, 1).toggle_reset(), ToggleReset::All);
        assert_eq!(
            SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, 8).toggle_reset(),
            ToggleReset::None
        );
    }

    #[test]
    fn test_clear_other_feature_keeps_toggle() {
        let mut setup = SetupPacket::clear_endpoint_halt(0x02);
        setup.value = 0x0001;
        assert_eq!(setup.toggle_reset(), ToggleReset::None);
    }
}
