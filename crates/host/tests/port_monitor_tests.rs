//! Root hub port monitor integration tests
//!
//! Drives port-change handling against the simulated controller:
//! - USB3 and USB2 connect paths
//! - Disconnect and teardown
//! - Link state failures, informational and unknown change bits
//! - Full re-scan per event and the dispatcher task
//!
//! Run with: `cargo test -p host --test port_monitor_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use common::{HubEvent, create_event_bridge};
use host::sim::{Fault, SimCommand, SimulatedController};
use host::{
    CommandError, DeviceId, HostError, LinkState, PortAction, PortChange, PortId, PortRegisters,
    RootHub, SlotId, spawn_dispatcher,
};
use protocol::{DeviceSpeed, Direction};
use std::sync::Arc;
use std::time::Duration;

fn setup(ports: u8) -> (Arc<SimulatedController>, RootHub<SimulatedController>) {
    let sim = Arc::new(SimulatedController::new(ports));
    let hub = RootHub::new(sim.clone());
    (sim, hub)
}

// ============================================================================
// Connect
// ============================================================================

mod connect {
    use super::*;

    #[tokio::test]
    async fn test_usb3_device_enumerates_on_connect() {
        let (sim, hub) = setup(4);
        sim.attach(PortId(3), DeviceSpeed::Super);

        let actions = hub.handle_port_change_event().await;
        assert_eq!(
            actions,
            vec![PortAction::Enumerated {
                port: PortId(3),
                device: DeviceId(1)
            }]
        );

        let device = hub.device_at(PortId(3)).await.unwrap();
        assert!(device.is_online().await);
        assert_eq!(device.slot(), SlotId(1));
        assert_eq!(device.name(), Some("usb1-ss"));
        assert!(device.is_published());

        let ep0 = device.endpoint(0, Direction::Both).await.unwrap();
        assert_eq!(ep0.max_packet_size(), 512);
        assert_eq!(ep0.bandwidth(), 0);

        assert_eq!(sim.published(), vec!["usb1-ss".to_string()]);
        assert_eq!(
            sim.commands(),
            vec![
                SimCommand::EnableSlot(SlotId(1)),
                SimCommand::AddressDevice {
                    slot: SlotId(1),
                    port: PortId(3)
                },
                SimCommand::Publish("usb1-ss".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_change_bits_cleared_before_handling() {
        let (sim, hub) = setup(4);
        sim.attach(PortId(3), DeviceSpeed::Super);
        hub.handle_port_change_event().await;
        assert!(sim.read_port(PortId(3)).changes.is_empty());

        // Nothing pending: a second scan does nothing
        assert!(hub.handle_port_change_event().await.is_empty());
    }

    #[tokio::test]
    async fn test_usb2_device_enumerates_after_reset() {
        let (sim, hub) = setup(4);
        sim.attach(PortId(1), DeviceSpeed::High);

        let actions = hub.handle_port_change_event().await;
        assert_eq!(actions, vec![PortAction::ResetIssued { port: PortId(1) }]);
        assert!(hub.device_at(PortId(1)).await.is_none());
        assert!(sim.commands().contains(&SimCommand::ResetPort(PortId(1))));

        let actions = hub.handle_port_change_event().await;
        assert_eq!(
            actions,
            vec![PortAction::Enumerated {
                port: PortId(1),
                device: DeviceId(1)
            }]
        );

        let device = hub.device_at(PortId(1)).await.unwrap();
        assert_eq!(device.name(), Some("usb1-hs"));
        let ep0 = device.endpoint(0, Direction::Both).await.unwrap();
        assert_eq!(ep0.max_packet_size(), 8);
    }

    #[tokio::test]
    async fn test_usb3_port_that_failed_to_enable() {
        let (sim, hub) = setup(4);
        sim.attach_with_link_state(PortId(2), DeviceSpeed::Super, LinkState::Disabled);

        let actions = hub.handle_port_change_event().await;
        assert_eq!(
            actions,
            vec![PortAction::EnumerationFailed {
                port: PortId(2),
                error: HostError::EnableFailed(PortId(2))
            }]
        );
        assert_eq!(sim.slots_in_use(), 0);
        assert!(hub.device_at(PortId(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_usb3_port_in_invalid_link_state() {
        let (sim, hub) = setup(4);
        sim.attach_with_link_state(PortId(2), DeviceSpeed::Super, LinkState::Polling);

        let actions = hub.handle_port_change_event().await;
        assert_eq!(
            actions,
            vec![PortAction::EnumerationFailed {
                port: PortId(2),
                error: HostError::InvalidLinkState {
                    port: PortId(2),
                    state: LinkState::Polling
                }
            }]
        );
        assert!(sim.commands().is_empty());
    }

    #[tokio::test]
    async fn test_failed_enumeration_retried_on_next_event() {
        let (sim, hub) = setup(4);
        sim.inject(Fault::AllocateSlot);
        sim.attach(PortId(1), DeviceSpeed::Super);

        let actions = hub.handle_port_change_event().await;
        match &actions[..] {
            [PortAction::EnumerationFailed { port, error }] => {
                assert_eq!(*port, PortId(1));
                assert_eq!(*error, HostError::Command(CommandError::CompletionCode(4)));
                assert!(error.is_retryable());
            }
            other => panic!("unexpected actions: {:?}", other),
        }

        sim.clear_fault(Fault::AllocateSlot);
        sim.attach(PortId(1), DeviceSpeed::Super);
        let actions = hub.handle_port_change_event().await;
        assert!(matches!(actions[..], [PortAction::Enumerated { .. }]));
    }

    #[tokio::test]
    async fn test_reset_change_without_device_does_nothing() {
        let (sim, hub) = setup(4);
        sim.raise(PortId(2), PortChange::PORT_RESET);

        assert!(hub.handle_port_change_event().await.is_empty());
        assert!(sim.commands().is_empty());
    }
}

// ============================================================================
// Disconnect
// ============================================================================

mod disconnect {
    use super::*;

    #[tokio::test]
    async fn test_disconnect_tears_device_down() {
        let (sim, hub) = setup(4);
        sim.attach(PortId(3), DeviceSpeed::Super);
        hub.handle_port_change_event().await;
        let device = hub.device_at(PortId(3)).await.unwrap();
        sim.clear_commands();

        sim.detach(PortId(3));
        let actions = hub.handle_port_change_event().await;
        assert_eq!(
            actions,
            vec![PortAction::Disconnected {
                port: PortId(3),
                device: Some(DeviceId(1))
            }]
        );

        assert!(hub.device_at(PortId(3)).await.is_none());
        assert!(!device.is_online().await);
        assert!(device.endpoints().await.is_empty());
        assert!(hub.registry().is_empty().await);
        assert!(sim.published().is_empty());
        assert_eq!(sim.slots_in_use(), 0);
        assert_eq!(
            sim.commands(),
            vec![
                SimCommand::Unpublish("usb1-ss".to_string()),
                SimCommand::Deconfigure(SlotId(1)),
                SimCommand::DisableSlot(SlotId(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_of_empty_port_is_noop() {
        let (sim, hub) = setup(4);
        sim.detach(PortId(2));

        let actions = hub.handle_port_change_event().await;
        assert_eq!(
            actions,
            vec![PortAction::Disconnected {
                port: PortId(2),
                device: None
            }]
        );
        assert!(sim.commands().is_empty());
    }

    #[tokio::test]
    async fn test_port_reusable_after_disconnect() {
        let (sim, hub) = setup(4);
        sim.attach(PortId(1), DeviceSpeed::Super);
        hub.handle_port_change_event().await;
        sim.detach(PortId(1));
        hub.handle_port_change_event().await;

        sim.attach(PortId(1), DeviceSpeed::Super);
        let actions = hub.handle_port_change_event().await;
        assert_eq!(
            actions,
            vec![PortAction::Enumerated {
                port: PortId(1),
                device: DeviceId(2)
            }]
        );
        assert_eq!(hub.device_at(PortId(1)).await.unwrap().name(), Some("usb2-ss"));
    }
}

// ============================================================================
// Other change bits
// ============================================================================

mod change_bits {
    use super::*;

    #[tokio::test]
    async fn test_informational_changes_acknowledged() {
        let (sim, hub) = setup(4);
        sim.raise(PortId(2), PortChange::OVER_CURRENT | PortChange::LINK_STATE);

        let actions = hub.handle_port_change_event().await;
        assert_eq!(
            actions,
            vec![PortAction::Acknowledged {
                port: PortId(2),
                changes: PortChange::OVER_CURRENT | PortChange::LINK_STATE
            }]
        );
        assert!(sim.read_port(PortId(2)).changes.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_bits_reported_as_ignored() {
        let (sim, hub) = setup(4);
        sim.raise(PortId(4), PortChange::from_bits_retain(1 << 30));

        let actions = hub.handle_port_change_event().await;
        assert_eq!(
            actions,
            vec![PortAction::Ignored {
                port: PortId(4),
                bits: 1 << 30
            }]
        );
        assert!(sim.read_port(PortId(4)).changes.is_empty());
    }

    #[tokio::test]
    async fn test_one_event_rescans_every_port() {
        let (sim, hub) = setup(4);
        sim.attach(PortId(4), DeviceSpeed::Super);
        sim.attach(PortId(1), DeviceSpeed::SuperPlus);

        let actions = hub.handle_port_change_event().await;
        assert_eq!(
            actions,
            vec![
                PortAction::Enumerated {
                    port: PortId(1),
                    device: DeviceId(1)
                },
                PortAction::Enumerated {
                    port: PortId(4),
                    device: DeviceId(2)
                },
            ]
        );
        assert_eq!(hub.devices().await.len(), 2);
        assert_eq!(hub.device_at(PortId(1)).await.unwrap().name(), Some("usb1-ps"));
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

mod dispatcher {
    use super::*;

    async fn wait_for_devices(hub: &RootHub<SimulatedController>, count: usize) {
        with_timeout(DEFAULT_TEST_TIMEOUT, async {
            while hub.devices().await.len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("devices did not settle");
    }

    #[tokio::test]
    async fn test_dispatcher_enumerates_and_stops() {
        let (events, receiver) = create_event_bridge(16);
        let sim = Arc::new(SimulatedController::new(4).with_events(events.clone()));
        let hub = Arc::new(RootHub::new(sim.clone()));
        let dispatcher = spawn_dispatcher(hub.clone(), receiver);

        sim.attach(PortId(3), DeviceSpeed::Super);
        sim.attach(PortId(1), DeviceSpeed::High);
        wait_for_devices(&hub, 2).await;

        sim.detach(PortId(3));
        wait_for_devices(&hub, 1).await;
        assert!(hub.device_at(PortId(1)).await.is_some());

        events.send(HubEvent::Shutdown).await.unwrap();
        with_timeout(DEFAULT_TEST_TIMEOUT, dispatcher)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_stops_when_bridge_closes() {
        let (events, receiver) = create_event_bridge(4);
        let sim = Arc::new(SimulatedController::new(2));
        let hub = Arc::new(RootHub::new(sim));
        let dispatcher = spawn_dispatcher(hub, receiver);

        drop(events);
        with_timeout(DEFAULT_TEST_TIMEOUT, dispatcher)
            .await
            .unwrap()
            .unwrap();
    }
}
