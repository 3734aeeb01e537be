//! Common utilities for the USB host stack
//!
//! This crate provides shared functionality for the host control plane and
//! its binaries: error handling, logging setup, the event bridge that carries
//! hardware port-change notifications to the per-controller dispatcher task,
//! and test helpers.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{EventReceiver, EventSender, HubEvent, create_event_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
