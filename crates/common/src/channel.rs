//! Event bridge between the hardware interrupt path and the hub dispatcher
//!
//! Port-change notifications may be raised from any context (an interrupt
//! handler thread, a simulated controller, a test). They are funnelled through
//! one bounded channel so that exactly one dispatcher task per controller
//! consumes them, which keeps root hub processing for a controller serialized.

use async_channel::{Receiver, Sender, TrySendError, bounded};

/// Default bridge capacity
pub const DEFAULT_EVENT_QUEUE_DEPTH: usize = 256;

/// Events delivered to the hub dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// Controller reported a port status change
    ///
    /// The port is informational only: the hardware may coalesce changes, so
    /// the dispatcher re-scans every port.
    PortStatusChange {
        /// Port the event TRB named (1-based)
        port: u8,
    },

    /// Stop the dispatcher
    Shutdown,
}

/// Producer side, cloned into every event source
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<HubEvent>,
}

impl EventSender {
    /// Send an event, waiting for queue space
    pub async fn send(&self, event: HubEvent) -> crate::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send from a blocking (non-async) context
    pub fn send_blocking(&self, event: HubEvent) -> crate::Result<()> {
        self.tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Raise a port-change notification without blocking
    ///
    /// A full queue is not an error: a pending notification already guarantees
    /// a full re-scan that will observe this change too.
    pub fn notify_port_change(&self, port: u8) -> crate::Result<()> {
        match self.tx.try_send(HubEvent::PortStatusChange { port }) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => {
                Err(crate::Error::Channel("event bridge closed".to_string()))
            }
        }
    }
}

/// Consumer side, owned by the single dispatcher task
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<HubEvent>,
}

impl EventReceiver {
    /// Receive the next event
    pub async fn recv(&self) -> crate::Result<HubEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an already-queued event without waiting
    pub fn try_recv(&self) -> Option<HubEvent> {
        self.rx.try_recv().ok()
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the event bridge
///
/// Returns (EventSender for event sources, EventReceiver for the dispatcher)
pub fn create_event_bridge(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    (EventSender { tx }, EventReceiver { rx })
}
