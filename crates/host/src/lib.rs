//! Host-side control plane for a USB host controller
//!
//! This crate owns the root hub's ports and drives everything between a
//! hardware port-change notification and a completed data transfer:
//! - Root hub port monitor: re-scans every port's change bits and classifies
//!   connect, disconnect and reset-complete events
//! - Device lifecycle: slot allocation, addressing, publishing and teardown
//! - Endpoint registry with bandwidth reservation
//! - Transfer batch scheduling with an exactly-once completion guarantee
//! - A waiting adapter for callers that want to block on one batch
//!
//! Hardware specifics stay behind the collaborator traits in [`controller`]:
//! a command executor, the port registers, and a device publisher.
//! [`sim::SimulatedController`] implements all three for tests and the
//! `usb-host-sim` binary.

pub mod batch;
pub mod config;
pub mod controller;
pub mod device;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod port;
pub mod port_monitor;
pub mod registry;
pub mod scheduler;
pub mod sim;
pub mod sync_wait;

pub use batch::{BatchId, Completion, CompletionCallback, TransferBatch, TransferRequest};
pub use controller::{
    BandwidthTable, CommandError, CommandExecutor, DefaultEndpointConfig, DevicePublisher,
    HostController, PortId, PortRegisters, PublishError, ScheduleHook, SlotId,
};
pub use device::{Device, DeviceId, DeviceInfo, MAX_ENDPOINTS};
pub use dispatcher::{run_dispatcher, spawn_dispatcher};
pub use endpoint::{Endpoint, EndpointDescriptor, bandwidth_for};
pub use error::{ErrorClass, HostError, Result};
pub use hub::RootHub;
pub use port::{LinkState, PortChange, PortStatus};
pub use port_monitor::PortAction;
pub use registry::EndpointRegistry;
pub use scheduler::{TransferHandle, TransferScheduler};
