//! Root hub port monitor
//!
//! A port-change event only says that some port changed; the hardware may
//! coalesce several changes into one event. Every event therefore triggers a
//! scan of all ports in order. Each port's change bits are acknowledged
//! before they are acted upon so that a change arriving during handling
//! raises a fresh event.

use crate::controller::{HostController, PortId};
use crate::device::DeviceId;
use crate::error::HostError;
use crate::hub::RootHub;
use crate::port::{LinkState, PortChange, PortStatus};
use tracing::{debug, error, info, warn};

/// What a port scan did about one change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortAction {
    Enumerated {
        port: PortId,
        device: DeviceId,
    },
    /// Enumeration was not possible or failed part way
    EnumerationFailed {
        port: PortId,
        error: HostError,
    },
    /// USB2 device connected; enumeration follows reset completion
    ResetIssued {
        port: PortId,
    },
    Disconnected {
        port: PortId,
        device: Option<DeviceId>,
    },
    /// Changes that were only acknowledged and logged
    Acknowledged {
        port: PortId,
        changes: PortChange,
    },
    /// Unrecognized change bits
    Ignored {
        port: PortId,
        bits: u32,
    },
}

impl<C: HostController> RootHub<C> {
    /// Scan every port and handle its pending changes
    pub async fn handle_port_change_event(&self) -> Vec<PortAction> {
        let mut actions = Vec::new();
        for port in 1..=self.max_ports() {
            self.handle_port(PortId(port), &mut actions).await;
        }
        actions
    }

    async fn handle_port(&self, port: PortId, actions: &mut Vec<PortAction>) {
        let status = self.controller.read_port(port);
        let changes = status.changes;
        if changes.is_empty() {
            return;
        }

        self.controller.clear_changes(port, changes);
        debug!("Port {} changes: {:?}", port, changes);

        if changes.contains(PortChange::CONNECT_STATUS) {
            let action = if status.connected {
                self.handle_connected(port, &status).await
            } else {
                info!("Device disconnected from port {}", port);
                // Scanned ports are always in range.
                let device = self.disconnect(port).await.unwrap_or_default();
                PortAction::Disconnected { port, device }
            };
            actions.push(action);
        }

        let informational = changes.intersection(PortChange::INFORMATIONAL);
        if !informational.is_empty() {
            for (flag, what) in [
                (PortChange::PORT_ENABLED, "Port enabled changed"),
                (PortChange::WARM_RESET, "Port warm reset completed"),
                (PortChange::OVER_CURRENT, "Port over-current changed"),
                (PortChange::LINK_STATE, "Port link state changed"),
                (PortChange::CONFIG_ERROR, "Port configuration error"),
            ] {
                if informational.contains(flag) {
                    info!("{} on port {}", what, port);
                }
            }
            actions.push(PortAction::Acknowledged {
                port,
                changes: informational,
            });
        }

        if changes.contains(PortChange::PORT_RESET) {
            info!("Port reset on port {} completed", port);
            if !status.speed.is_usb3() && status.connected {
                actions.push(self.enumerate_port(port).await);
            }
        }

        let unknown = changes.unrecognized();
        if unknown != 0 {
            warn!("Port change ({:#010x}) ignored on port {}", unknown, port);
            actions.push(PortAction::Ignored { port, bits: unknown });
        }
    }

    async fn handle_connected(&self, port: PortId, status: &PortStatus) -> PortAction {
        info!("Detected new {} device on port {}", status.speed, port);

        if !status.speed.is_usb3() {
            debug!("USB2 device attached to port {}, issuing reset", port);
            self.controller.reset_port(port);
            return PortAction::ResetIssued { port };
        }

        match status.link_state {
            LinkState::Enabled => self.enumerate_port(port).await,
            LinkState::Disabled => {
                error!("USB3 port {} couldn't be enabled", port);
                PortAction::EnumerationFailed {
                    port,
                    error: HostError::EnableFailed(port),
                }
            }
            state => {
                error!("USB3 port {} is in invalid link state {}", port, state);
                PortAction::EnumerationFailed {
                    port,
                    error: HostError::InvalidLinkState { port, state },
                }
            }
        }
    }

    async fn enumerate_port(&self, port: PortId) -> PortAction {
        match self.enumerate(port).await {
            Ok(device) => PortAction::Enumerated {
                port,
                device: device.id(),
            },
            Err(error) => {
                error!("Failed to enumerate device on port {}: {}", port, error);
                PortAction::EnumerationFailed { port, error }
            }
        }
    }
}
