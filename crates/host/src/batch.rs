//! Transfer batches
//!
//! A batch is one submission to one endpoint: the buffer, the SETUP packet
//! for control transfers, and the callback that receives the outcome. A batch
//! finishes exactly once, by hardware completion, by abort, or by being
//! discarded when the hardware refused it. Only completion and abort deliver
//! the callback.

use crate::endpoint::{Endpoint, lock_unpoisoned};
use protocol::{Direction, SetupPacket, ToggleReset, TransferType, UsbError};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Batch identifier, unique per scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome delivered to a batch's callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub batch: BatchId,
    /// Bytes actually transferred
    pub transferred: usize,
    pub result: Result<(), UsbError>,
    /// The submitted buffer; holds received data for IN transfers
    pub buffer: Vec<u8>,
}

impl Completion {
    /// Received bytes for a successful transfer
    pub fn into_result(self) -> Result<Vec<u8>, UsbError> {
        self.result?;
        let mut buffer = self.buffer;
        buffer.truncate(self.transferred);
        Ok(buffer)
    }
}

/// Receives a batch's outcome, exactly once
pub type CompletionCallback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// A transfer as requested by a caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub endpoint: u8,
    pub direction: Direction,
    pub buffer: Vec<u8>,
    pub size: usize,
    pub setup: Option<SetupPacket>,
}

impl TransferRequest {
    /// Control transfer on the default endpoint
    ///
    /// For device-to-host requests `data` is ignored and a buffer of
    /// wLength bytes is allocated.
    pub fn control(setup: SetupPacket, data: Vec<u8>) -> Self {
        let (direction, buffer) = if setup.is_in() {
            (Direction::In, vec![0; usize::from(setup.length)])
        } else {
            (Direction::Out, data)
        };
        Self {
            endpoint: 0,
            direction,
            size: buffer.len(),
            buffer,
            setup: Some(setup),
        }
    }

    /// Device-to-host transfer of up to `size` bytes
    pub fn read(endpoint: u8, size: usize) -> Self {
        Self {
            endpoint,
            direction: Direction::In,
            buffer: vec![0; size],
            size,
            setup: None,
        }
    }

    /// Host-to-device transfer of `data`
    pub fn write(endpoint: u8, data: Vec<u8>) -> Self {
        Self {
            endpoint,
            direction: Direction::Out,
            size: data.len(),
            buffer: data,
            setup: None,
        }
    }
}

/// How a batch finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    Completed,
    Aborted,
    /// Refused by the hardware; the callback never ran
    Discarded,
}

enum BatchState {
    Pending {
        buffer: Vec<u8>,
        on_complete: CompletionCallback,
    },
    Finished(Finish),
}

pub struct TransferBatch {
    id: BatchId,
    endpoint: Arc<Endpoint>,
    direction: Direction,
    size: usize,
    setup: Option<SetupPacket>,
    toggle_reset: ToggleReset,
    state: Mutex<BatchState>,
}

impl TransferBatch {
    pub(crate) fn new(
        id: BatchId,
        endpoint: Arc<Endpoint>,
        request: TransferRequest,
        on_complete: CompletionCallback,
    ) -> Self {
        let toggle_reset = match (endpoint.transfer_type(), &request.setup) {
            (TransferType::Control, Some(setup)) => setup.toggle_reset(),
            _ => ToggleReset::None,
        };
        let mut buffer = request.buffer;
        if buffer.len() < request.size {
            buffer.resize(request.size, 0);
        }

        Self {
            id,
            endpoint,
            direction: request.direction,
            size: request.size,
            setup: request.setup,
            toggle_reset,
            state: Mutex::new(BatchState::Pending { buffer, on_complete }),
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn transfer_type(&self) -> TransferType {
        self.endpoint.transfer_type()
    }

    /// Requested transfer size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn setup(&self) -> Option<&SetupPacket> {
        self.setup.as_ref()
    }

    /// Data toggles this batch resets once it completes
    pub fn toggle_reset(&self) -> ToggleReset {
        self.toggle_reset
    }

    pub fn is_finished(&self) -> bool {
        matches!(*lock_unpoisoned(&self.state), BatchState::Finished(_))
    }

    /// How the batch finished, if it has
    pub fn finish(&self) -> Option<Finish> {
        match *lock_unpoisoned(&self.state) {
            BatchState::Finished(finish) => Some(finish),
            BatchState::Pending { .. } => None,
        }
    }

    /// Copy of the outgoing data of a pending host-to-device batch
    pub fn out_data(&self) -> Option<Vec<u8>> {
        if self.direction == Direction::In {
            return None;
        }
        match &*lock_unpoisoned(&self.state) {
            BatchState::Pending { buffer, .. } => Some(buffer[..self.size].to_vec()),
            BatchState::Finished(_) => None,
        }
    }

    /// Store received data into a pending batch's buffer
    ///
    /// Returns the number of bytes stored, at most the requested size.
    pub fn write_in_data(&self, data: &[u8]) -> usize {
        match &mut *lock_unpoisoned(&self.state) {
            BatchState::Pending { buffer, .. } => {
                let len = data.len().min(self.size);
                buffer[..len].copy_from_slice(&data[..len]);
                len
            }
            BatchState::Finished(_) => 0,
        }
    }

    /// Report the hardware outcome and run the callback
    ///
    /// Returns false if the batch had already finished, in which case
    /// nothing happens.
    pub fn complete(&self, transferred: usize, result: Result<(), UsbError>) -> bool {
        self.finish_with(Finish::Completed, transferred.min(self.size), result)
    }

    /// Finish with [`UsbError::Aborted`] and run the callback
    pub(crate) fn abort(&self) -> bool {
        self.finish_with(Finish::Aborted, 0, Err(UsbError::Aborted))
    }

    /// Finish without running the callback
    pub(crate) fn discard(&self) -> bool {
        self.take_pending(Finish::Discarded).is_some()
    }

    fn finish_with(
        &self,
        finish: Finish,
        transferred: usize,
        result: Result<(), UsbError>,
    ) -> bool {
        let Some((buffer, on_complete)) = self.take_pending(finish) else {
            return false;
        };

        trace!(
            "Batch {} on endpoint {} finished ({:?}, {} bytes)",
            self.id,
            self.endpoint.number(),
            finish,
            transferred
        );
        on_complete(Completion {
            batch: self.id,
            transferred,
            result,
            buffer,
        });
        true
    }

    /// Move out of the pending state, releasing the endpoint's active slot
    ///
    /// Lock order is the endpoint's active slot, then the batch state.
    fn take_pending(&self, finish: Finish) -> Option<(Vec<u8>, CompletionCallback)> {
        let mut active = self.endpoint.lock_active();
        let mut state = lock_unpoisoned(&self.state);

        if matches!(*state, BatchState::Finished(_)) {
            return None;
        }
        let BatchState::Pending { buffer, on_complete } =
            std::mem::replace(&mut *state, BatchState::Finished(finish))
        else {
            return None;
        };

        if active.as_ref().is_some_and(|current| current.id == self.id) {
            *active = None;
        }
        Some((buffer, on_complete))
    }
}

impl fmt::Debug for TransferBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBatch")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.number())
            .field("direction", &self.direction)
            .field("size", &self.size)
            .field("setup", &self.setup)
            .field("toggle_reset", &self.toggle_reset)
            .finish_non_exhaustive()
    }
}
