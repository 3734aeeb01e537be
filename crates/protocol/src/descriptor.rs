//! Device descriptor header
//!
//! Only the leading 8 bytes of the standard device descriptor are decoded:
//! they are all a host needs to size the default control endpoint, and every
//! device must answer a GET_DESCRIPTOR of that length even before its real
//! bMaxPacketSize0 is known.

use crate::error::{ProtocolError, Result};
use crate::setup::descriptor_type;
use crate::types::DeviceSpeed;
use byteorder::{ByteOrder, LittleEndian};

/// Bytes of the device descriptor needed to learn bMaxPacketSize0
pub const DEVICE_DESCRIPTOR_HEADER_SIZE: usize = 8;

/// Full length of a standard device descriptor
pub const DEVICE_DESCRIPTOR_SIZE: u8 = 18;

/// Leading part of a standard device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptorHeader {
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// Raw bMaxPacketSize0 (an exponent for SuperSpeed devices)
    pub max_packet_size0: u8,
}

impl DeviceDescriptorHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DEVICE_DESCRIPTOR_HEADER_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: DEVICE_DESCRIPTOR_HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let (length, kind) = (bytes[0], bytes[1]);
        if kind != descriptor_type::DEVICE || length != DEVICE_DESCRIPTOR_SIZE {
            return Err(ProtocolError::InvalidDescriptor {
                descriptor_type: kind,
                length,
            });
        }

        Ok(Self {
            usb_version: LittleEndian::read_u16(&bytes[2..4]),
            class: bytes[4],
            subclass: bytes[5],
            protocol: bytes[6],
            max_packet_size0: bytes[7],
        })
    }

    /// Control endpoint max packet size in bytes for a device of `speed`
    pub fn control_max_packet_size(&self, speed: DeviceSpeed) -> Result<u16> {
        let raw = self.max_packet_size0;
        let invalid = || ProtocolError::InvalidMaxPacketSize { value: raw, speed };

        match speed {
            DeviceSpeed::Super | DeviceSpeed::SuperPlus => {
                // SuperSpeed encodes the size as a power of two; only 2^9 is legal.
                if raw == 9 { Ok(512) } else { Err(invalid()) }
            }
            DeviceSpeed::High => {
                if raw == 64 { Ok(64) } else { Err(invalid()) }
            }
            DeviceSpeed::Full => match raw {
                8 | 16 | 32 | 64 => Ok(u16::from(raw)),
                _ => Err(invalid()),
            },
            DeviceSpeed::Low => {
                if raw == 8 { Ok(8) } else { Err(invalid()) }
            }
        }
    }
}
