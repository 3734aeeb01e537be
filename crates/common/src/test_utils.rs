//! Test utilities for the USB host stack
//!
//! Provides canned descriptors and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_device_descriptor;
//!
//! let descriptor = create_mock_device_descriptor(64);
//! assert_eq!(descriptor.len(), 18);
//! assert_eq!(descriptor[7], 64);
//! ```

use protocol::DeviceSpeed;
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock USB device descriptor (GET_DESCRIPTOR Device)
///
/// Returns a standard 18-byte device descriptor with the given raw
/// bMaxPacketSize0 value.
pub fn create_mock_device_descriptor(max_packet_size0: u8) -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        max_packet_size0, // bMaxPacketSize0
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Raw bMaxPacketSize0 a typical device of `speed` reports
pub fn typical_max_packet_size0(speed: DeviceSpeed) -> u8 {
    match speed {
        DeviceSpeed::Low => 8,
        DeviceSpeed::Full | DeviceSpeed::High => 64,
        DeviceSpeed::Super | DeviceSpeed::SuperPlus => 9,
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
