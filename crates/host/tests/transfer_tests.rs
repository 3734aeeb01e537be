//! Transfer scheduling integration tests
//!
//! Covers submission checks, the exactly-once completion guarantee, aborts
//! (explicit, by teardown, and by timeout) and the waiting adapter.
//!
//! Run with: `cargo test -p host --test transfer_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use host::sim::{CompletionMode, Fault, SimCommand, SimulatedController};
use host::{
    Completion, Device, EndpointDescriptor, ErrorClass, HostError, PortId, RootHub,
    TransferRequest,
};
use protocol::{
    DeviceDescriptorHeader, DeviceSpeed, Direction, SetupPacket, ToggleReset, UsbError,
    descriptor_type,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn setup(mode: CompletionMode) -> (Arc<SimulatedController>, RootHub<SimulatedController>) {
    let sim = Arc::new(SimulatedController::new(4).with_completion_mode(mode));
    let hub = RootHub::new(sim.clone());
    (sim, hub)
}

async fn enumerated(
    sim: &SimulatedController,
    hub: &RootHub<SimulatedController>,
    port: PortId,
) -> Arc<Device> {
    sim.attach(port, DeviceSpeed::Super);
    hub.handle_port_change_event().await;
    hub.device_at(port).await.expect("device enumerated")
}

/// Callback that counts invocations and keeps the last completion
#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<AtomicUsize>,
    last: Arc<Mutex<Option<Completion>>>,
}

impl Recorder {
    fn callback(&self) -> impl FnOnce(Completion) + Send + 'static {
        let recorder = self.clone();
        move |completion| {
            recorder.calls.fetch_add(1, Ordering::SeqCst);
            *recorder.last.lock().unwrap() = Some(completion);
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last(&self) -> Option<Completion> {
        self.last.lock().unwrap().clone()
    }
}

fn get_device_descriptor() -> TransferRequest {
    TransferRequest::control(
        SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, 8),
        Vec::new(),
    )
}

// ============================================================================
// Submission checks
// ============================================================================

mod submission {
    use super::*;

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let (sim, hub) = setup(CompletionMode::Hold);
        let device = enumerated(&sim, &hub, PortId(1)).await;
        let recorder = Recorder::default();

        let err = hub
            .submit(&device, TransferRequest::read(3, 64), recorder.callback())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HostError::EndpointNotFound {
                device: device.id(),
                number: 3,
                direction: Direction::In
            }
        );
        assert_eq!(recorder.calls(), 0);
    }

    #[tokio::test]
    async fn test_submit_to_offline_device() {
        let (sim, hub) = setup(CompletionMode::Hold);
        let device = enumerated(&sim, &hub, PortId(1)).await;
        sim.detach(PortId(1));
        hub.handle_port_change_event().await;

        let recorder = Recorder::default();
        let err = hub
            .submit(&device, get_device_descriptor(), recorder.callback())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::EndpointNotFound { number: 0, .. }));
        assert_eq!(err.class(), ErrorClass::ProtocolViolation);
        assert_eq!(recorder.calls(), 0);
        assert!(sim.pending().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_larger_than_reservation() {
        let (sim, hub) = setup(CompletionMode::Hold);
        let device = enumerated(&sim, &hub, PortId(3)).await;
        hub.register_endpoint(&device, EndpointDescriptor::bulk(1, Direction::In, 512, 2))
            .await
            .unwrap();
        let recorder = Recorder::default();

        let err = hub
            .submit(&device, TransferRequest::read(1, 4096), recorder.callback())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HostError::InsufficientBandwidth {
                needed: 4096,
                reserved: 1024
            }
        );
        assert_eq!(recorder.calls(), 0);
        assert!(sim.pending().is_empty());

        // Exactly the reservation fits
        hub.submit(&device, TransferRequest::read(1, 1024), recorder.callback())
            .await
            .unwrap();
        assert_eq!(sim.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_controller_without_scheduling() {
        let sim = Arc::new(SimulatedController::new(4).without_scheduling());
        let hub = RootHub::new(sim.clone());
        let device = enumerated(&sim, &hub, PortId(1)).await;
        let recorder = Recorder::default();

        let err = hub
            .submit(&device, get_device_descriptor(), recorder.callback())
            .await
            .unwrap_err();
        assert_eq!(err, HostError::NotSupported);
        assert_eq!(recorder.calls(), 0);
    }

    #[tokio::test]
    async fn test_schedule_failure_discards_batch() {
        let (sim, hub) = setup(CompletionMode::Hold);
        let device = enumerated(&sim, &hub, PortId(1)).await;
        sim.inject(Fault::Schedule);
        let recorder = Recorder::default();

        let err = hub
            .submit(&device, get_device_descriptor(), recorder.callback())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Command(_)));
        assert_eq!(recorder.calls(), 0);

        let ep0 = device.endpoint(0, Direction::Both).await.unwrap();
        assert!(!ep0.is_active());

        sim.clear_fault(Fault::Schedule);
        hub.submit(&device, get_device_descriptor(), recorder.callback())
            .await
            .unwrap();
        assert!(ep0.is_active());
    }

    #[tokio::test]
    async fn test_one_outstanding_batch_per_endpoint() {
        let (sim, hub) = setup(CompletionMode::Hold);
        let device = enumerated(&sim, &hub, PortId(1)).await;
        let first = Recorder::default();
        let second = Recorder::default();

        hub.submit(&device, get_device_descriptor(), first.callback())
            .await
            .unwrap();
        let err = hub
            .submit(&device, get_device_descriptor(), second.callback())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::EndpointBusy { number: 0, .. }));

        assert_eq!(sim.complete_pending(), 1);
        hub.submit(&device, get_device_descriptor(), second.callback())
            .await
            .unwrap();
        assert_eq!(first.calls(), 1);
    }

    #[tokio::test]
    async fn test_control_batch_carries_toggle_reset() {
        let (sim, hub) = setup(CompletionMode::Hold);
        let device = enumerated(&sim, &hub, PortId(1)).await;

        hub.submit(
            &device,
            TransferRequest::control(SetupPacket::set_configuration(1), Vec::new()),
            |_| {},
        )
        .await
        .unwrap();

        let ep0 = device.endpoint(0, Direction::Both).await.unwrap();
        let batch = ep0.active_batch().unwrap();
        assert_eq!(batch.toggle_reset(), ToggleReset::All);
        assert_eq!(batch.direction(), Direction::Out);
    }

    #[tokio::test]
    async fn test_out_data_visible_to_controller() {
        let (sim, hub) = setup(CompletionMode::Hold);
        let device = enumerated(&sim, &hub, PortId(1)).await;
        hub.register_endpoint(&device, EndpointDescriptor::bulk(2, Direction::Out, 512, 1))
            .await
            .unwrap();

        hub.submit(&device, TransferRequest::write(2, vec![1, 2, 3, 4]), |_| {})
            .await
            .unwrap();
        let ep = device.endpoint(2, Direction::Out).await.unwrap();
        assert_eq!(ep.active_batch().unwrap().out_data(), Some(vec![1, 2, 3, 4]));
    }
}

// ============================================================================
// Completion and abort
// ============================================================================

mod completion {
    use super::*;

    #[tokio::test]
    async fn test_callback_runs_exactly_once() {
        let (sim, hub) = setup(CompletionMode::Hold);
        let device = enumerated(&sim, &hub, PortId(1)).await;
        let recorder = Recorder::default();

        let handle = hub
            .submit(&device, get_device_descriptor(), recorder.callback())
            .await
            .unwrap();
        assert!(handle.is_pending());
        assert_eq!(sim.pending(), vec![handle.id()]);

        assert_eq!(sim.complete_pending(), 1);
        assert_eq!(recorder.calls(), 1);
        assert!(!handle.is_pending());

        // Abort after completion is a no-op
        assert_eq!(hub.abort_transfer(&handle), Ok(false));
        let ep0 = device.endpoint(0, Direction::Both).await.unwrap();
        assert_eq!(hub.abort(&ep0), Ok(false));
        assert_eq!(recorder.calls(), 1);

        let completion = recorder.last().unwrap();
        assert_eq!(completion.batch, handle.id());
        assert_eq!(completion.result, Ok(()));
        assert_eq!(completion.transferred, 8);
        let header = DeviceDescriptorHeader::parse(&completion.buffer).unwrap();
        assert_eq!(header.max_packet_size0, 9);
    }

    #[tokio::test]
    async fn test_abort_pending_batch() {
        let (sim, hub) = setup(CompletionMode::Hold);
        let device = enumerated(&sim, &hub, PortId(1)).await;
        let recorder = Recorder::default();

        let handle = hub
            .submit(&device, get_device_descriptor(), recorder.callback())
            .await
            .unwrap();
        let ep0 = device.endpoint(0, Direction::Both).await.unwrap();

        assert_eq!(hub.abort(&ep0), Ok(true));
        assert_eq!(recorder.calls(), 1);
        assert_eq!(recorder.last().unwrap().result, Err(UsbError::Aborted));
        assert!(!ep0.is_active());
        assert!(sim.pending().is_empty());
        assert!(sim.commands().contains(&SimCommand::Cancel(handle.id())));

        // The hardware finishing later changes nothing
        assert_eq!(sim.complete_pending(), 0);
        assert_eq!(recorder.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_failure_still_aborts() {
        let (sim, hub) = setup(CompletionMode::Hold);
        let device = enumerated(&sim, &hub, PortId(1)).await;
        let recorder = Recorder::default();
        sim.inject(Fault::Cancel);

        let handle = hub
            .submit(&device, get_device_descriptor(), recorder.callback())
            .await
            .unwrap();

        let err = hub.abort_transfer(&handle).unwrap_err();
        assert!(matches!(err, HostError::Command(_)));
        assert_eq!(recorder.calls(), 1);
        assert_eq!(recorder.last().unwrap().result, Err(UsbError::Aborted));

        // Still held by the hardware, but already finished
        assert_eq!(sim.complete_pending(), 0);
        assert_eq!(hub.abort_transfer(&handle), Ok(false));
        assert_eq!(recorder.calls(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_aborts_active_batch() {
        let (sim, hub) = setup(CompletionMode::Hold);
        let device = enumerated(&sim, &hub, PortId(2)).await;
        let recorder = Recorder::default();

        hub.submit(&device, get_device_descriptor(), recorder.callback())
            .await
            .unwrap();

        sim.detach(PortId(2));
        hub.handle_port_change_event().await;

        assert_eq!(recorder.calls(), 1);
        assert_eq!(recorder.last().unwrap().result, Err(UsbError::Aborted));
        assert!(hub.registry().is_empty().await);
        assert_eq!(sim.complete_pending(), 0);
        assert_eq!(recorder.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_transfer_reports_code() {
        let (sim, hub) = setup(CompletionMode::Hold);
        let device = enumerated(&sim, &hub, PortId(1)).await;
        let recorder = Recorder::default();

        hub.submit(&device, get_device_descriptor(), recorder.callback())
            .await
            .unwrap();
        assert_eq!(sim.fail_pending(UsbError::Stall), 1);

        let completion = recorder.last().unwrap();
        assert_eq!(completion.result, Err(UsbError::Stall));
        assert_eq!(completion.into_result(), Err(UsbError::Stall));
    }
}

// ============================================================================
// Waiting adapter
// ============================================================================

mod waiting {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_data() {
        let (sim, hub) = setup(CompletionMode::Immediate);
        let device = enumerated(&sim, &hub, PortId(1)).await;

        let (transferred, buffer) = with_timeout(
            DEFAULT_TEST_TIMEOUT,
            hub.submit_and_wait(&device, get_device_descriptor()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(transferred, 8);
        let header = DeviceDescriptorHeader::parse(&buffer).unwrap();
        assert_eq!(header.control_max_packet_size(DeviceSpeed::Super), Ok(512));
    }

    #[tokio::test]
    async fn test_wait_on_bulk_endpoint() {
        let (sim, hub) = setup(CompletionMode::Immediate);
        let device = enumerated(&sim, &hub, PortId(1)).await;
        hub.register_endpoint(&device, EndpointDescriptor::bulk(1, Direction::In, 512, 2))
            .await
            .unwrap();

        let (transferred, buffer) = with_timeout(
            DEFAULT_TEST_TIMEOUT,
            hub.submit_and_wait(&device, TransferRequest::read(1, 1000)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(transferred, 1000);
        assert!(buffer.iter().all(|&b| b == 0xA5));
    }

    #[tokio::test]
    async fn test_wait_surfaces_submission_error() {
        let (sim, hub) = setup(CompletionMode::Immediate);
        let device = enumerated(&sim, &hub, PortId(1)).await;

        let err = hub
            .submit_and_wait(&device, TransferRequest::read(5, 8))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::EndpointNotFound { number: 5, .. }));
    }

    #[tokio::test]
    async fn test_wait_surfaces_transfer_error() {
        let sim = Arc::new(SimulatedController::new(4).with_completion_mode(CompletionMode::Hold));
        let hub = Arc::new(RootHub::new(sim.clone()));
        let device = enumerated(&sim, &hub, PortId(1)).await;

        let waiter = {
            let hub = hub.clone();
            let device = device.clone();
            tokio::spawn(async move { hub.submit_and_wait(&device, get_device_descriptor()).await })
        };

        with_timeout(DEFAULT_TEST_TIMEOUT, async {
            while sim.pending().is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        sim.fail_pending(UsbError::Babble);

        let result = with_timeout(DEFAULT_TEST_TIMEOUT, waiter).await.unwrap().unwrap();
        let err = result.unwrap_err();
        assert_eq!(err, HostError::Transfer(UsbError::Babble));
        assert_eq!(err.class(), ErrorClass::Transfer);
    }

    #[tokio::test]
    async fn test_wait_returns_abort_on_disconnect() {
        let sim = Arc::new(SimulatedController::new(4).with_completion_mode(CompletionMode::Hold));
        let hub = Arc::new(RootHub::new(sim.clone()));
        let device = enumerated(&sim, &hub, PortId(3)).await;

        let waiter = {
            let hub = hub.clone();
            let device = device.clone();
            tokio::spawn(async move { hub.submit_and_wait(&device, get_device_descriptor()).await })
        };

        with_timeout(DEFAULT_TEST_TIMEOUT, async {
            while sim.pending().is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        sim.detach(PortId(3));
        hub.handle_port_change_event().await;

        let result = with_timeout(DEFAULT_TEST_TIMEOUT, waiter).await.unwrap().unwrap();
        assert_eq!(result, Err(HostError::Transfer(UsbError::Aborted)));
        assert!(sim.pending().is_empty());
        assert!(hub.device_at(PortId(3)).await.is_none());
    }

    #[tokio::test]
    async fn test_wait_timeout_aborts_batch() {
        let (sim, hub) = setup(CompletionMode::Hold);
        let device = enumerated(&sim, &hub, PortId(1)).await;

        let err = hub
            .submit_and_wait_timeout(&device, get_device_descriptor(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, HostError::TimedOut);
        assert!(sim.pending().is_empty());

        let ep0 = device.endpoint(0, Direction::Both).await.unwrap();
        assert!(!ep0.is_active());
    }

    #[tokio::test]
    async fn test_wait_timeout_not_hit() {
        let (sim, hub) = setup(CompletionMode::Immediate);
        let device = enumerated(&sim, &hub, PortId(1)).await;

        let (transferred, _) = hub
            .submit_and_wait_timeout(&device, get_device_descriptor(), DEFAULT_TEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(transferred, 8);
    }
}
