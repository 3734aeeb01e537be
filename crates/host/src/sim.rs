//! Simulated host controller
//!
//! Implements every collaborator trait in memory: scripted port state with
//! write-1-to-clear change bits, slot and address allocation, a bandwidth
//! table, a schedule hook that answers transfers like a minimal device, and a
//! publisher. Command failures can be injected, scheduled batches can be held
//! until the caller completes them, and every command is logged.

use crate::batch::{BatchId, TransferBatch};
use crate::config::ControllerSettings;
use crate::controller::{
    BandwidthTable, CommandError, CommandExecutor, DefaultEndpointConfig, DevicePublisher, PortId,
    PortRegisters, PublishError, ScheduleHook, SlotId,
};
use crate::device::DeviceInfo;
use crate::endpoint::lock_unpoisoned;
use crate::port::{LinkState, PortChange, PortStatus};
use common::EventSender;
use common::test_utils::{create_mock_device_descriptor, typical_max_packet_size0};
use protocol::{
    DeviceSpeed, Direction, PortSpeed, SpeedClass, UsbAddress, UsbError, descriptor_type, request,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

/// Completion code reported by an injected command failure
pub const INJECTED_COMPLETION_CODE: u8 = 4;

/// Completion code for a command naming a slot that was never enabled
const SLOT_NOT_ENABLED: u8 = 11;

/// Default bandwidth reported per port
pub const DEFAULT_PORT_BANDWIDTH: u64 = 7500;

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    AllocateSlot,
    AddressDevice,
    Deconfigure,
    DisableSlot,
    QueryBandwidth,
    Schedule,
    Cancel,
    Publish,
    Unpublish,
}

/// When scheduled batches complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Shortly after scheduling, on the runtime
    #[default]
    Immediate,
    /// Only when the caller completes them
    Hold,
}

/// Logged controller interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCommand {
    EnableSlot(SlotId),
    AddressDevice { slot: SlotId, port: PortId },
    Deconfigure(SlotId),
    DisableSlot(SlotId),
    QueryBandwidth(SlotId),
    ResetPort(PortId),
    Schedule(BatchId),
    Cancel(BatchId),
    Publish(String),
    Unpublish(String),
}

#[derive(Debug, Clone)]
struct SimPort {
    connected: bool,
    link_state: LinkState,
    speed: PortSpeed,
    changes: PortChange,
    max_packet_size0: u8,
}

impl SimPort {
    fn empty() -> Self {
        Self {
            connected: false,
            link_state: LinkState::Disabled,
            speed: PortSpeed::new(DeviceSpeed::High),
            changes: PortChange::empty(),
            max_packet_size0: typical_max_packet_size0(DeviceSpeed::High),
        }
    }
}

struct SimState {
    ports: Vec<SimPort>,
    max_slots: u8,
    /// Enabled slots and the port each was addressed on
    slots: BTreeMap<SlotId, Option<PortId>>,
    next_address: u8,
    port_bandwidth: u64,
    faults: HashSet<Fault>,
    completion: CompletionMode,
    pending: Vec<Arc<TransferBatch>>,
    log: Vec<SimCommand>,
    names: HashMap<PortId, String>,
    published: Vec<String>,
}

impl SimState {
    fn port_mut(&mut self, port: PortId) -> Option<&mut SimPort> {
        usize::from(port.0)
            .checked_sub(1)
            .and_then(|i| self.ports.get_mut(i))
    }

    fn port(&self, port: PortId) -> Option<&SimPort> {
        usize::from(port.0).checked_sub(1).and_then(|i| self.ports.get(i))
    }

    fn check(&self, fault: Fault) -> Result<(), CommandError> {
        if self.faults.contains(&fault) {
            return Err(CommandError::CompletionCode(INJECTED_COMPLETION_CODE));
        }
        Ok(())
    }

    /// bMaxPacketSize0 of the device a batch is addressed to
    fn max_packet_size0_for(&self, batch: &TransferBatch) -> u8 {
        batch
            .endpoint()
            .device()
            .and_then(|device| self.port(device.port()).map(|port| port.max_packet_size0))
            .unwrap_or(typical_max_packet_size0(DeviceSpeed::High))
    }
}

pub struct SimulatedController {
    state: Mutex<SimState>,
    events: Option<EventSender>,
    max_ports: u8,
    scheduling: bool,
}

impl SimulatedController {
    pub fn new(max_ports: u8) -> Self {
        Self {
            state: Mutex::new(SimState {
                ports: vec![SimPort::empty(); usize::from(max_ports)],
                max_slots: 32,
                slots: BTreeMap::new(),
                next_address: 1,
                port_bandwidth: DEFAULT_PORT_BANDWIDTH,
                faults: HashSet::new(),
                completion: CompletionMode::Immediate,
                pending: Vec::new(),
                log: Vec::new(),
                names: HashMap::new(),
                published: Vec::new(),
            }),
            events: None,
            max_ports,
            scheduling: true,
        }
    }

    pub fn from_settings(settings: &ControllerSettings) -> Self {
        Self::new(settings.max_ports)
            .with_max_slots(settings.max_slots)
            .with_port_bandwidth(settings.port_bandwidth)
    }

    pub fn with_max_slots(self, max_slots: u8) -> Self {
        self.lock().max_slots = max_slots;
        self
    }

    pub fn with_port_bandwidth(self, bandwidth: u64) -> Self {
        self.lock().port_bandwidth = bandwidth;
        self
    }

    /// Raise port-change notifications on `events`
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Controller without a schedule hook
    pub fn without_scheduling(mut self) -> Self {
        self.scheduling = false;
        self
    }

    pub fn with_completion_mode(self, mode: CompletionMode) -> Self {
        self.set_completion_mode(mode);
        self
    }

    pub fn set_completion_mode(&self, mode: CompletionMode) {
        self.lock().completion = mode;
    }

    /// Connect a device; USB3 ports come up enabled
    pub fn attach(&self, port: PortId, speed: DeviceSpeed) {
        let link_state = if speed.class().is_usb3() {
            LinkState::Enabled
        } else {
            LinkState::Polling
        };
        self.attach_with_link_state(port, speed, link_state);
    }

    pub fn attach_with_link_state(&self, port: PortId, speed: DeviceSpeed, link_state: LinkState) {
        {
            let mut state = self.lock();
            let Some(sim_port) = state.port_mut(port) else {
                warn!("Cannot attach to nonexistent port {}", port);
                return;
            };
            sim_port.connected = true;
            sim_port.link_state = link_state;
            sim_port.speed = PortSpeed::new(speed);
            sim_port.max_packet_size0 = typical_max_packet_size0(speed);
            sim_port.changes |= PortChange::CONNECT_STATUS;
        }
        debug!("Simulated {} device attached to port {}", speed, port);
        self.notify(port);
    }

    pub fn detach(&self, port: PortId) {
        {
            let mut state = self.lock();
            let Some(sim_port) = state.port_mut(port) else {
                return;
            };
            sim_port.connected = false;
            sim_port.link_state = LinkState::Disabled;
            sim_port.changes |= PortChange::CONNECT_STATUS;
        }
        debug!("Simulated device detached from port {}", port);
        self.notify(port);
    }

    /// Set arbitrary change bits, including unrecognized ones
    pub fn raise(&self, port: PortId, changes: PortChange) {
        {
            let mut state = self.lock();
            let Some(sim_port) = state.port_mut(port) else {
                return;
            };
            sim_port.changes |= changes;
        }
        self.notify(port);
    }

    /// bMaxPacketSize0 the device on `port` reports
    pub fn set_max_packet_size0(&self, port: PortId, raw: u8) {
        if let Some(sim_port) = self.lock().port_mut(port) {
            sim_port.max_packet_size0 = raw;
        }
    }

    pub fn assign_name(&self, port: PortId, name: impl Into<String>) {
        self.lock().names.insert(port, name.into());
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.insert(fault);
    }

    pub fn clear_fault(&self, fault: Fault) {
        self.lock().faults.remove(&fault);
    }

    /// Batches held by [`CompletionMode::Hold`]
    pub fn pending(&self) -> Vec<BatchId> {
        self.lock().pending.iter().map(|batch| batch.id()).collect()
    }

    /// Complete every held batch successfully
    pub fn complete_pending(&self) -> usize {
        let pending = std::mem::take(&mut self.lock().pending);
        pending.iter().filter(|batch| self.finish_transfer(batch)).count()
    }

    /// Complete every held batch with `error`
    pub fn fail_pending(&self, error: UsbError) -> usize {
        let pending = std::mem::take(&mut self.lock().pending);
        pending
            .iter()
            .filter(|batch| batch.complete(0, Err(error.clone())))
            .count()
    }

    pub fn commands(&self) -> Vec<SimCommand> {
        self.lock().log.clone()
    }

    pub fn clear_commands(&self) {
        self.lock().log.clear();
    }

    /// Names of currently published devices
    pub fn published(&self) -> Vec<String> {
        self.lock().published.clone()
    }

    pub fn slots_in_use(&self) -> usize {
        self.lock().slots.len()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        lock_unpoisoned(&self.state)
    }

    fn notify(&self, port: PortId) {
        if let Some(events) = &self.events
            && let Err(e) = events.notify_port_change(port.0)
        {
            warn!("Failed to raise port change for port {}: {}", port, e);
        }
    }

    fn finish_transfer(&self, batch: &TransferBatch) -> bool {
        let max_packet_size0 = self.lock().max_packet_size0_for(batch);
        batch.complete(respond(batch, max_packet_size0), Ok(()))
    }
}

/// Answer a transfer like a minimal device would, returning the byte count
fn respond(batch: &TransferBatch, max_packet_size0: u8) -> usize {
    match batch.direction() {
        Direction::In => {
            let data = match batch.setup() {
                Some(setup)
                    if setup.request == request::GET_DESCRIPTOR
                        && (setup.value >> 8) as u8 == descriptor_type::DEVICE =>
                {
                    create_mock_device_descriptor(max_packet_size0)
                }
                _ => vec![0xA5; batch.size()],
            };
            batch.write_in_data(&data)
        }
        Direction::Out | Direction::Both => batch.size(),
    }
}

impl CommandExecutor for SimulatedController {
    async fn allocate_slot(&self) -> Result<SlotId, CommandError> {
        let mut state = self.lock();
        state.check(Fault::AllocateSlot)?;

        let slot = (1..=state.max_slots)
            .map(SlotId)
            .find(|slot| !state.slots.contains_key(slot))
            .ok_or(CommandError::NoSlotsAvailable)?;
        state.slots.insert(slot, None);
        state.log.push(SimCommand::EnableSlot(slot));
        Ok(slot)
    }

    async fn address_device(
        &self,
        slot: SlotId,
        port: PortId,
        ep0: &DefaultEndpointConfig,
    ) -> Result<UsbAddress, CommandError> {
        let mut state = self.lock();
        state.check(Fault::AddressDevice)?;
        match state.slots.get_mut(&slot) {
            Some(addressed) => *addressed = Some(port),
            None => return Err(CommandError::CompletionCode(SLOT_NOT_ENABLED)),
        }

        let address = UsbAddress(state.next_address);
        state.next_address = if state.next_address >= 127 {
            1
        } else {
            state.next_address + 1
        };
        state.log.push(SimCommand::AddressDevice { slot, port });
        trace!(
            "Slot {} addressed as {} (ep0 max packet size {})",
            slot, address, ep0.max_packet_size
        );
        Ok(address)
    }

    async fn deconfigure(&self, slot: SlotId) -> Result<(), CommandError> {
        let mut state = self.lock();
        state.check(Fault::Deconfigure)?;
        state.log.push(SimCommand::Deconfigure(slot));
        Ok(())
    }

    async fn disable_slot(&self, slot: SlotId) -> Result<(), CommandError> {
        let mut state = self.lock();
        state.check(Fault::DisableSlot)?;
        if state.slots.remove(&slot).is_none() {
            return Err(CommandError::CompletionCode(SLOT_NOT_ENABLED));
        }
        state.log.push(SimCommand::DisableSlot(slot));
        Ok(())
    }

    async fn query_bandwidth(
        &self,
        slot: SlotId,
        _speed: SpeedClass,
    ) -> Result<BandwidthTable, CommandError> {
        let mut state = self.lock();
        state.check(Fault::QueryBandwidth)?;
        state.log.push(SimCommand::QueryBandwidth(slot));
        Ok(BandwidthTable::uniform(self.max_ports, state.port_bandwidth))
    }

    fn schedule_hook(&self) -> Option<&dyn ScheduleHook> {
        if self.scheduling { Some(self) } else { None }
    }
}

impl ScheduleHook for SimulatedController {
    fn schedule(&self, batch: Arc<TransferBatch>) -> Result<(), CommandError> {
        let mode = {
            let mut state = self.lock();
            state.check(Fault::Schedule)?;
            state.log.push(SimCommand::Schedule(batch.id()));
            if state.completion == CompletionMode::Hold {
                state.pending.push(batch.clone());
            }
            state.completion
        };

        if mode == CompletionMode::Immediate {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let max_packet_size0 = self.lock().max_packet_size0_for(&batch);
                    runtime.spawn(async move {
                        batch.complete(respond(&batch, max_packet_size0), Ok(()));
                    });
                }
                Err(_) => {
                    self.finish_transfer(&batch);
                }
            }
        }
        Ok(())
    }

    fn cancel(&self, batch: &TransferBatch) -> Result<(), CommandError> {
        let mut state = self.lock();
        state.check(Fault::Cancel)?;
        state.pending.retain(|held| held.id() != batch.id());
        state.log.push(SimCommand::Cancel(batch.id()));
        Ok(())
    }
}

impl PortRegisters for SimulatedController {
    fn max_ports(&self) -> u8 {
        self.max_ports
    }

    fn read_port(&self, port: PortId) -> PortStatus {
        let state = self.lock();
        let sim_port = state.port(port).cloned().unwrap_or_else(SimPort::empty);
        PortStatus {
            connected: sim_port.connected,
            link_state: sim_port.link_state,
            speed: sim_port.speed,
            changes: sim_port.changes,
        }
    }

    fn clear_changes(&self, port: PortId, changes: PortChange) {
        if let Some(sim_port) = self.lock().port_mut(port) {
            sim_port.changes.remove(changes);
        }
    }

    fn reset_port(&self, port: PortId) {
        let connected = {
            let mut state = self.lock();
            state.log.push(SimCommand::ResetPort(port));
            match state.port_mut(port) {
                Some(sim_port) if sim_port.connected => {
                    sim_port.link_state = LinkState::Enabled;
                    sim_port.changes |= PortChange::PORT_RESET;
                    true
                }
                _ => false,
            }
        };
        if connected {
            self.notify(port);
        }
    }
}

impl DevicePublisher for SimulatedController {
    fn assigned_name(&self, port: PortId) -> Option<String> {
        self.lock().names.get(&port).cloned()
    }

    fn publish(&self, device: &DeviceInfo) -> Result<(), PublishError> {
        let mut state = self.lock();
        if state.faults.contains(&Fault::Publish) {
            return Err(PublishError("injected publish failure".to_string()));
        }
        let name = device.name.clone().unwrap_or_default();
        state.published.push(name.clone());
        state.log.push(SimCommand::Publish(name));
        Ok(())
    }

    fn unpublish(&self, device: &DeviceInfo) -> Result<(), PublishError> {
        let mut state = self.lock();
        if state.faults.contains(&Fault::Unpublish) {
            return Err(PublishError("injected unpublish failure".to_string()));
        }
        let name = device.name.clone().unwrap_or_default();
        state.published.retain(|published| *published != name);
        state.log.push(SimCommand::Unpublish(name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_bits_are_write_one_to_clear() {
        let sim = SimulatedController::new(2);
        sim.attach(PortId(1), DeviceSpeed::Super);
        sim.raise(PortId(1), PortChange::OVER_CURRENT);

        let status = sim.read_port(PortId(1));
        assert!(status.connected);
        assert_eq!(status.link_state, LinkState::Enabled);
        assert_eq!(
            status.changes,
            PortChange::CONNECT_STATUS | PortChange::OVER_CURRENT
        );

        sim.clear_changes(PortId(1), PortChange::CONNECT_STATUS);
        assert_eq!(sim.read_port(PortId(1)).changes, PortChange::OVER_CURRENT);
    }

    #[test]
    fn test_reset_raises_port_reset_change() {
        let sim = SimulatedController::new(2);
        sim.attach(PortId(2), DeviceSpeed::High);
        assert_eq!(sim.read_port(PortId(2)).link_state, LinkState::Polling);

        sim.clear_changes(PortId(2), PortChange::all());
        sim.reset_port(PortId(2));

        let status = sim.read_port(PortId(2));
        assert_eq!(status.link_state, LinkState::Enabled);
        assert_eq!(status.changes, PortChange::PORT_RESET);
        assert_eq!(sim.commands(), vec![SimCommand::ResetPort(PortId(2))]);
    }

    #[test]
    fn test_out_of_range_port_reads_empty() {
        let sim = SimulatedController::new(1);
        sim.attach(PortId(5), DeviceSpeed::High);
        assert!(!sim.read_port(PortId(5)).connected);
        assert!(sim.read_port(PortId(0)).changes.is_empty());
    }

    #[tokio::test]
    async fn test_slot_allocation_exhausts() {
        let sim = SimulatedController::new(1).with_max_slots(2);
        assert_eq!(sim.allocate_slot().await, Ok(SlotId(1)));
        assert_eq!(sim.allocate_slot().await, Ok(SlotId(2)));
        assert_eq!(sim.allocate_slot().await, Err(CommandError::NoSlotsAvailable));

        sim.disable_slot(SlotId(1)).await.unwrap();
        assert_eq!(sim.allocate_slot().await, Ok(SlotId(1)));
        assert_eq!(sim.slots_in_use(), 2);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let sim = SimulatedController::new(1);
        sim.inject(Fault::AllocateSlot);
        assert_eq!(
            sim.allocate_slot().await,
            Err(CommandError::CompletionCode(INJECTED_COMPLETION_CODE))
        );

        sim.clear_fault(Fault::AllocateSlot);
        let slot = sim.allocate_slot().await.unwrap();
        let config = DefaultEndpointConfig::for_max_packet_size(8);
        assert_eq!(
            sim.address_device(slot, PortId(1), &config).await,
            Ok(UsbAddress(1))
        );
        assert_eq!(
            sim.address_device(SlotId(9), PortId(1), &config).await,
            Err(CommandError::CompletionCode(SLOT_NOT_ENABLED))
        );
    }

    #[test]
    fn test_scheduling_can_be_disabled() {
        let sim = SimulatedController::new(1);
        assert!(sim.schedule_hook().is_some());
        let sim = sim.without_scheduling();
        assert!(sim.schedule_hook().is_none());
    }

    #[test]
    fn test_port_changes_reach_event_bridge() {
        let (events, receiver) = common::create_event_bridge(8);
        let sim = SimulatedController::new(2).with_events(events);
        sim.attach(PortId(2), DeviceSpeed::Full);
        assert_eq!(
            receiver.try_recv(),
            Some(common::HubEvent::PortStatusChange { port: 2 })
        );
    }
}
