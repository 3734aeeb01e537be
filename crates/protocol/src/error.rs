//! Protocol error types

use thiserror::Error;

/// Errors decoding protocol structures (SETUP packets, descriptors)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too small for the structure being decoded
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Descriptor header does not describe the expected descriptor
    #[error("Invalid descriptor: type {descriptor_type:#04x}, length {length}")]
    InvalidDescriptor { descriptor_type: u8, length: u8 },

    /// bMaxPacketSize0 value not allowed for the device speed
    #[error("Invalid control max packet size {value} for {speed} speed")]
    InvalidMaxPacketSize { value: u8, speed: crate::DeviceSpeed },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::BufferTooSmall {
            needed: 8,
            available: 3,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Buffer too small"));
        assert!(msg.contains('8'));
    }

    #[test]
    fn test_invalid_descriptor_display() {
        let err = ProtocolError::InvalidDescriptor {
            descriptor_type: 0x02,
            length: 9,
        };
        assert!(err.to_string().contains("0x02"));
    }
}
