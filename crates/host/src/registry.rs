//! Endpoint registry
//!
//! Tracks every registered endpoint of every device on the root hub together
//! with the bandwidth reserved for it. Registration and unregistration are
//! strictly paired: the reservation taken at registration is released exactly
//! once, when the same endpoint is unregistered.

use crate::controller::CommandExecutor;
use crate::device::{Device, DeviceId};
use crate::endpoint::{Endpoint, EndpointDescriptor};
use crate::error::{HostError, Result};
use protocol::Direction;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EndpointKey {
    device: DeviceId,
    number: u8,
    direction: Direction,
}

impl EndpointKey {
    fn of(endpoint: &Endpoint) -> Self {
        Self {
            device: endpoint.device_id(),
            number: endpoint.number(),
            direction: endpoint.direction(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    endpoints: HashMap<EndpointKey, Arc<Endpoint>>,
    reserved: HashMap<DeviceId, u64>,
}

#[derive(Default)]
pub struct EndpointRegistry {
    state: Mutex<RegistryState>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register an endpoint of `device`, reserving its bandwidth
    ///
    /// Endpoints that need bandwidth are checked against what the controller
    /// reports for the device's port, minus what the device already holds.
    pub async fn register<E: CommandExecutor>(
        &self,
        executor: &E,
        device: &Arc<Device>,
        descriptor: &EndpointDescriptor,
    ) -> Result<Arc<Endpoint>> {
        let key = EndpointKey {
            device: device.id(),
            number: descriptor.number,
            direction: descriptor.direction,
        };
        let need = descriptor.reservation();

        let available = if need > 0 {
            let table = executor
                .query_bandwidth(device.slot(), device.speed().class)
                .await
                .map_err(|e| {
                    warn!("Bandwidth query for slot {} failed: {}", device.slot(), e);
                    HostError::BandwidthUnavailable(e)
                })?;
            Some(table.available(device.port()))
        } else {
            None
        };

        let mut state = self.state.lock().await;
        if state.endpoints.contains_key(&key) {
            return Err(HostError::EndpointOccupied {
                device: key.device,
                number: key.number,
                direction: key.direction,
            });
        }

        let reserved = state.reserved.get(&key.device).copied().unwrap_or(0);
        if let Some(available) = available
            && reserved.saturating_add(need) > available
        {
            return Err(HostError::BandwidthExhausted {
                port: device.port(),
                requested: need,
                available: available.saturating_sub(reserved),
            });
        }

        let endpoint = Arc::new(Endpoint::new(device, descriptor, need));
        state.endpoints.insert(key, endpoint.clone());
        if need > 0 {
            *state.reserved.entry(key.device).or_default() += need;
        }

        debug!(
            "Registered {} endpoint {} ({}) of device {}, reserved {}",
            descriptor.transfer_type.short_name(),
            key.number,
            key.direction,
            key.device,
            need
        );
        Ok(endpoint)
    }

    /// Remove `endpoint` and release its reservation
    pub async fn unregister(&self, endpoint: &Arc<Endpoint>) -> Result<()> {
        let key = EndpointKey::of(endpoint);
        let mut state = self.state.lock().await;

        let registered = state
            .endpoints
            .get(&key)
            .is_some_and(|registered| Arc::ptr_eq(registered, endpoint));
        if !registered {
            return Err(HostError::EndpointNotFound {
                device: key.device,
                number: key.number,
                direction: key.direction,
            });
        }
        state.endpoints.remove(&key);

        let bandwidth = endpoint.bandwidth();
        if bandwidth > 0
            && let Some(reserved) = state.reserved.get_mut(&key.device)
        {
            *reserved = reserved.saturating_sub(bandwidth);
            if *reserved == 0 {
                state.reserved.remove(&key.device);
            }
        }

        debug!(
            "Unregistered endpoint {} ({}) of device {}, released {}",
            key.number, key.direction, key.device, bandwidth
        );
        Ok(())
    }

    /// Look up a registered endpoint of an online device
    ///
    /// A bidirectional endpoint with the same number matches either
    /// direction.
    pub async fn find(
        &self,
        device: &Device,
        number: u8,
        direction: Direction,
    ) -> Option<Arc<Endpoint>> {
        if !device.is_online().await {
            return None;
        }

        let state = self.state.lock().await;
        let key = EndpointKey {
            device: device.id(),
            number,
            direction,
        };
        state
            .endpoints
            .get(&key)
            .or_else(|| {
                state.endpoints.get(&EndpointKey {
                    direction: Direction::Both,
                    ..key
                })
            })
            .cloned()
    }

    /// Bandwidth currently reserved by `device`
    pub async fn reserved_for(&self, device: DeviceId) -> u64 {
        self.state.lock().await.reserved.get(&device).copied().unwrap_or(0)
    }

    /// Number of registered endpoints
    pub async fn len(&self) -> usize {
        self.state.lock().await.endpoints.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.endpoints.is_empty()
    }
}
