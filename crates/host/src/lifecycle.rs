//! Device lifecycle
//!
//! Enumeration takes a freshly connected port from slot allocation to a
//! published, online device; disconnection reverses it. Until a device is
//! published, failures unwind only what was acquired so far. After that,
//! every failure goes through the full teardown.

use crate::batch::TransferRequest;
use crate::controller::{DefaultEndpointConfig, HostController, PortId};
use crate::device::{Device, DeviceId, DeviceState, default_device_name, endpoint_index};
use crate::endpoint::{Endpoint, EndpointDescriptor};
use crate::error::{HostError, Result};
use crate::hub::RootHub;
use protocol::{
    DEVICE_DESCRIPTOR_HEADER_SIZE, DeviceDescriptorHeader, Direction, SetupPacket, descriptor_type,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

impl<C: HostController> RootHub<C> {
    /// Enumerate the device on `port`
    pub async fn enumerate(&self, port: PortId) -> Result<Arc<Device>> {
        let index = self.port_index(port)?;
        if self.devices.lock().await[index].is_some() {
            warn!("Port {} already has a device, not enumerating", port);
            return Err(HostError::PortOccupied(port));
        }

        let status = self.controller.read_port(port);
        let slot = self.controller.allocate_slot().await?;
        debug!("Obtained slot {} for device on port {}", slot, port);

        let device = Arc::new(Device::new(self.next_device_id(), port, slot, status.speed));

        let ep0 = {
            let mut state = device.lock_state().await;
            let descriptor = EndpointDescriptor::default_control(&status.speed);
            self.install_endpoint(&device, &mut state, descriptor).await
        };
        let ep0 = match ep0 {
            Ok(ep0) => ep0,
            Err(e) => {
                self.release_slot(&device).await;
                return Err(e);
            }
        };

        let config = DefaultEndpointConfig::for_max_packet_size(ep0.max_packet_size());
        let address = match self.controller.address_device(slot, port, &config).await {
            Ok(address) => address,
            Err(e) => {
                error!("Failed to address device on port {}: {}", port, e);
                if let Err(e) = self.registry.unregister(&ep0).await {
                    warn!("Failed to unregister default endpoint: {}", e);
                }
                self.release_slot(&device).await;
                return Err(e.into());
            }
        };
        device.set_address(address);
        debug!("Obtained USB address {} for device on port {}", address, port);
        device.set_online(true).await;

        let name = self
            .controller
            .assigned_name(port)
            .unwrap_or_else(|| default_device_name(address, &status.speed));
        device.set_name(name);

        if let Err(e) = self.controller.publish(&device.info().await) {
            error!("Failed to publish device '{}': {}", device.display_name(), e);
            self.teardown(&device).await;
            return Err(HostError::Publish(e));
        }
        device.mark_published();

        let occupied = {
            let mut devices = self.devices.lock().await;
            match &devices[index] {
                Some(_) => true,
                None => {
                    devices[index] = Some(device.clone());
                    false
                }
            }
        };
        if occupied {
            warn!(
                "Port {} gained a device during enumeration, discarding '{}'",
                port,
                device.display_name()
            );
            self.teardown(&device).await;
            return Err(HostError::PortOccupied(port));
        }

        info!(
            "Device '{}' ({}) enumerated on port {}: slot {}, address {}",
            device.display_name(),
            status.speed,
            port,
            slot,
            address
        );
        Ok(device)
    }

    /// Remove the device on `port` and tear it down
    ///
    /// Returns the id of the removed device; a port without a device is a
    /// no-op.
    pub async fn disconnect(&self, port: PortId) -> Result<Option<DeviceId>> {
        let index = self.port_index(port)?;

        let device = {
            let mut devices = self.devices.lock().await;
            let Some(device) = devices[index].clone() else {
                debug!("Port {} has no device to disconnect", port);
                return Ok(None);
            };
            device.set_online(false).await;
            devices[index] = None;
            device
        };

        info!(
            "Device '{}' at port {} has been disconnected",
            device.display_name(),
            port
        );
        self.teardown(&device).await;
        Ok(Some(device.id()))
    }

    /// Take `device` offline and release everything it holds
    ///
    /// Failures are logged and the teardown continues.
    pub(crate) async fn teardown(&self, device: &Arc<Device>) {
        let name = device.display_name();
        device.set_online(false).await;

        debug!("Aborting all active transfers to '{}'", name);
        for endpoint in device.endpoints().await {
            if let Err(e) = self.scheduler.abort(self.controller.as_ref(), &endpoint) {
                warn!(
                    "Failed to abort active {} transfer to endpoint {} of detached device '{}': {}",
                    endpoint.transfer_type(),
                    endpoint.number(),
                    name,
                    e
                );
            }
        }

        if device.is_published()
            && let Err(e) = self.controller.unpublish(&device.info().await)
        {
            warn!("Failed to unpublish device '{}': {}", name, e);
        }

        for endpoint in device.take_endpoints().await {
            if let Err(e) = self.registry.unregister(&endpoint).await {
                warn!(
                    "Failed to unregister endpoint {} of device '{}': {}",
                    endpoint.number(),
                    name,
                    e
                );
            }
        }

        if let Err(e) = self.controller.deconfigure(device.slot()).await {
            warn!("Failed to deconfigure device '{}': {}", name, e);
        }
        self.release_slot(device).await;

        debug!("Device '{}' torn down", name);
    }

    /// Register an endpoint of an online device
    pub async fn register_endpoint(
        &self,
        device: &Arc<Device>,
        descriptor: EndpointDescriptor,
    ) -> Result<Arc<Endpoint>> {
        let mut state = device.lock_state().await;
        if !state.online {
            return Err(HostError::DeviceOffline(device.id()));
        }
        self.install_endpoint(device, &mut state, descriptor).await
    }

    /// Unregister an endpoint, aborting its outstanding batch first
    pub async fn unregister_endpoint(
        &self,
        device: &Arc<Device>,
        number: u8,
        direction: Direction,
    ) -> Result<()> {
        let index =
            endpoint_index(number, direction).ok_or(HostError::InvalidEndpoint { number })?;
        let not_found = || HostError::EndpointNotFound {
            device: device.id(),
            number,
            direction,
        };

        let endpoint = device.lock_state().await.endpoints[index]
            .take()
            .ok_or_else(not_found)?;

        if let Err(e) = self.scheduler.abort(self.controller.as_ref(), &endpoint) {
            warn!("Failed to abort transfer on endpoint {}: {}", number, e);
        }
        self.registry.unregister(&endpoint).await
    }

    /// Replace the endpoint in `descriptor`'s slot with a new one
    pub async fn reconfigure_endpoint(
        &self,
        device: &Arc<Device>,
        descriptor: EndpointDescriptor,
    ) -> Result<Arc<Endpoint>> {
        if !device.is_online().await {
            return Err(HostError::DeviceOffline(device.id()));
        }
        if let Some(current) = device.endpoint(descriptor.number, descriptor.direction).await {
            self.unregister_endpoint(device, current.number(), current.direction())
                .await?;
        }
        self.register_endpoint(device, descriptor).await
    }

    /// Learn the device's real default control packet size and apply it
    ///
    /// Reads the first eight bytes of the device descriptor over the default
    /// endpoint and re-registers the endpoint if the size differs. A read
    /// still outstanding after `timeout` is aborted.
    pub async fn negotiate_default_endpoint(
        &self,
        device: &Arc<Device>,
        timeout: Duration,
    ) -> Result<u16> {
        let setup = SetupPacket::get_descriptor(
            descriptor_type::DEVICE,
            0,
            DEVICE_DESCRIPTOR_HEADER_SIZE as u16,
        );
        let (transferred, data) = self
            .submit_and_wait_timeout(
                device,
                TransferRequest::control(setup, Vec::new()),
                timeout,
            )
            .await?;

        let header = DeviceDescriptorHeader::parse(&data[..transferred.min(data.len())])
            .map_err(HostError::Descriptor)?;
        let max_packet_size = header
            .control_max_packet_size(device.speed().speed)
            .map_err(HostError::Descriptor)?;

        let current = device
            .endpoint(0, Direction::Both)
            .await
            .map(|ep| ep.max_packet_size());
        if current != Some(max_packet_size) {
            debug!(
                "Default endpoint of '{}' uses {} byte packets",
                device.display_name(),
                max_packet_size
            );
            self.reconfigure_endpoint(device, EndpointDescriptor::control(max_packet_size))
                .await?;
        }
        Ok(max_packet_size)
    }

    async fn install_endpoint(
        &self,
        device: &Arc<Device>,
        state: &mut DeviceState,
        descriptor: EndpointDescriptor,
    ) -> Result<Arc<Endpoint>> {
        let index = endpoint_index(descriptor.number, descriptor.direction).ok_or(
            HostError::InvalidEndpoint {
                number: descriptor.number,
            },
        )?;
        if state.endpoints[index].is_some() {
            return Err(HostError::EndpointOccupied {
                device: device.id(),
                number: descriptor.number,
                direction: descriptor.direction,
            });
        }

        let endpoint = self
            .registry
            .register(self.controller.as_ref(), device, &descriptor)
            .await?;
        state.endpoints[index] = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn release_slot(&self, device: &Device) {
        if let Err(e) = self.controller.disable_slot(device.slot()).await {
            warn!("Failed to disable slot {}: {}", device.slot(), e);
        }
    }
}
