//! Root hub
//!
//! Owns the per-port device table, the endpoint registry and the transfer
//! scheduler of one host controller. Port-change handling, device lifecycle
//! and transfer submission are implemented on [`RootHub`] in their own
//! modules.
//!
//! Locks are taken in the order root hub port table, then device, then
//! registry.

use crate::controller::{HostController, PortId};
use crate::device::{Device, DeviceId, DeviceInfo};
use crate::error::{HostError, Result};
use crate::registry::EndpointRegistry;
use crate::scheduler::TransferScheduler;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;
use tracing::info;

pub struct RootHub<C: HostController> {
    pub(crate) controller: Arc<C>,
    /// Device attached to each port, indexed by port number - 1
    pub(crate) devices: Mutex<Vec<Option<Arc<Device>>>>,
    pub(crate) registry: EndpointRegistry,
    pub(crate) scheduler: TransferScheduler,
    next_device_id: AtomicU32,
    max_ports: u8,
}

impl<C: HostController> RootHub<C> {
    pub fn new(controller: Arc<C>) -> Self {
        let max_ports = controller.max_ports();
        info!("Root hub with {} ports", max_ports);
        Self {
            controller,
            devices: Mutex::new(vec![None; usize::from(max_ports)]),
            registry: EndpointRegistry::new(),
            scheduler: TransferScheduler::new(),
            next_device_id: AtomicU32::new(1),
            max_ports,
        }
    }

    pub fn controller(&self) -> &Arc<C> {
        &self.controller
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn max_ports(&self) -> u8 {
        self.max_ports
    }

    /// Device attached to `port`, if any
    pub async fn device_at(&self, port: PortId) -> Option<Arc<Device>> {
        let index = self.port_index(port).ok()?;
        self.devices.lock().await[index].clone()
    }

    pub async fn find_device(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .await
            .iter()
            .flatten()
            .find(|device| device.id() == id)
            .cloned()
    }

    /// Snapshots of every attached device, in port order
    pub async fn devices(&self) -> Vec<DeviceInfo> {
        let attached: Vec<Arc<Device>> =
            self.devices.lock().await.iter().flatten().cloned().collect();
        let mut infos = Vec::with_capacity(attached.len());
        for device in attached {
            infos.push(device.info().await);
        }
        infos
    }

    /// Tear down every attached device
    pub async fn shutdown(&self) {
        info!("Shutting down root hub");
        for port in 1..=self.max_ports {
            // Ports are always in range here.
            let _ = self.disconnect(PortId(port)).await;
        }
    }

    pub(crate) fn port_index(&self, port: PortId) -> Result<usize> {
        if port.0 == 0 || port.0 > self.max_ports {
            return Err(HostError::InvalidPort(port));
        }
        Ok(usize::from(port.0) - 1)
    }

    pub(crate) fn next_device_id(&self) -> DeviceId {
        DeviceId(self.next_device_id.fetch_add(1, Ordering::Relaxed))
    }
}
