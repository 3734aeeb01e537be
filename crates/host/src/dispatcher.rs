//! Per-controller event dispatcher
//!
//! Exactly one dispatcher consumes a controller's event bridge, which keeps
//! all root hub processing for that controller serialized.

use crate::controller::HostController;
use crate::hub::RootHub;
use common::{EventReceiver, HubEvent};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Run the dispatcher on its own task
pub fn spawn_dispatcher<C: HostController>(
    hub: Arc<RootHub<C>>,
    events: EventReceiver,
) -> JoinHandle<()> {
    tokio::spawn(run_dispatcher(hub, events))
}

/// Handle events until shutdown or until every sender is gone
pub async fn run_dispatcher<C: HostController>(hub: Arc<RootHub<C>>, events: EventReceiver) {
    info!("Hub dispatcher started");

    loop {
        match events.recv().await {
            Ok(HubEvent::PortStatusChange { port }) => {
                debug!("Port status change event for port {}", port);

                // One scan observes every queued change; drop the duplicates.
                let mut shutdown = false;
                while let Some(event) = events.try_recv() {
                    if event == HubEvent::Shutdown {
                        shutdown = true;
                        break;
                    }
                }

                let actions = hub.handle_port_change_event().await;
                debug!("Port scan finished with {} actions", actions.len());

                if shutdown {
                    info!("Hub dispatcher received shutdown signal");
                    break;
                }
            }
            Ok(HubEvent::Shutdown) => {
                info!("Hub dispatcher received shutdown signal");
                break;
            }
            Err(e) => {
                warn!("Event bridge closed: {}", e);
                break;
            }
        }
    }

    info!("Hub dispatcher stopped");
}
