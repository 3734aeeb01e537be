//! Transfer batch scheduler
//!
//! Validates a transfer against the target endpoint, installs the batch as
//! the endpoint's active batch and hands it to the controller's schedule
//! hook. Each endpoint carries at most one outstanding batch.

use crate::batch::{
    BatchId, Completion, CompletionCallback, Finish, TransferBatch, TransferRequest,
};
use crate::controller::{CommandExecutor, HostController};
use crate::device::Device;
use crate::endpoint::{Endpoint, bandwidth_for};
use crate::error::{HostError, Result};
use crate::hub::RootHub;
use crate::registry::EndpointRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Caller's view of a submitted batch
#[derive(Debug, Clone)]
pub struct TransferHandle {
    id: BatchId,
    batch: Weak<TransferBatch>,
}

impl TransferHandle {
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Whether the batch is still waiting for its completion
    pub fn is_pending(&self) -> bool {
        self.batch.upgrade().is_some_and(|batch| !batch.is_finished())
    }

    pub(crate) fn batch(&self) -> Option<Arc<TransferBatch>> {
        self.batch.upgrade()
    }
}

#[derive(Debug)]
pub struct TransferScheduler {
    next_batch_id: AtomicU64,
}

impl Default for TransferScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferScheduler {
    pub fn new() -> Self {
        Self {
            next_batch_id: AtomicU64::new(1),
        }
    }

    /// Submit `request` to an endpoint of `device`
    ///
    /// On success the callback runs exactly once, later. On error it never
    /// runs.
    pub async fn submit<E: CommandExecutor>(
        &self,
        executor: &E,
        endpoints: &EndpointRegistry,
        device: &Arc<Device>,
        request: TransferRequest,
        on_complete: CompletionCallback,
    ) -> Result<TransferHandle> {
        let (number, direction) = (request.endpoint, request.direction);
        let not_found = || HostError::EndpointNotFound {
            device: device.id(),
            number,
            direction,
        };

        let endpoint = endpoints.find(device, number, direction).await.ok_or_else(|| {
            error!(
                "Endpoint {} ({}) of device '{}' not registered",
                number,
                direction,
                device.display_name()
            );
            not_found()
        })?;

        let needed = bandwidth_for(
            endpoint.transfer_type(),
            request.size,
            endpoint.max_packet_size(),
        );
        if needed > endpoint.bandwidth() {
            error!(
                "Endpoint {} ({}) does not have enough bandwidth reserved: {} needed, {} reserved",
                number,
                direction,
                needed,
                endpoint.bandwidth()
            );
            return Err(HostError::InsufficientBandwidth {
                needed,
                reserved: endpoint.bandwidth(),
            });
        }

        let Some(hook) = executor.schedule_hook() else {
            error!("Controller does not support transfer scheduling");
            return Err(HostError::NotSupported);
        };

        let id = BatchId(self.next_batch_id.fetch_add(1, Ordering::Relaxed));
        let batch = Arc::new(TransferBatch::new(id, endpoint.clone(), request, on_complete));

        {
            let state = device.lock_state().await;
            if !state.online || !state.holds(&endpoint) {
                return Err(not_found());
            }
            let mut active = endpoint.lock_active();
            if active.as_ref().is_some_and(|current| !current.is_finished()) {
                return Err(HostError::EndpointBusy {
                    device: device.id(),
                    number: endpoint.number(),
                    direction: endpoint.direction(),
                });
            }
            *active = Some(batch.clone());
        }

        debug!(
            "Batch {} ({} {} bytes) submitted to endpoint {} of '{}'",
            id,
            endpoint.transfer_type().short_name(),
            batch.size(),
            endpoint.number(),
            device.display_name()
        );

        match hook.schedule(batch.clone()) {
            Ok(()) => {
                // An abort between install and schedule cancelled nothing on
                // the hardware; take the finished batch back out.
                if batch.finish() == Some(Finish::Aborted) {
                    debug!("Batch {} was aborted while being scheduled", id);
                    if let Err(e) = hook.cancel(&batch) {
                        warn!("Cancelling aborted batch {} failed: {}", id, e);
                    }
                }
            }
            Err(e) => {
                if batch.discard() {
                    warn!("Scheduling batch {} failed: {}", id, e);
                    return Err(HostError::Command(e));
                }
                // Aborted in the meantime; its callback has already run.
                warn!("Scheduling batch {} failed after it was aborted: {}", id, e);
            }
        }

        Ok(TransferHandle {
            id,
            batch: Arc::downgrade(&batch),
        })
    }

    /// Abort the batch outstanding on `endpoint`
    ///
    /// Returns whether a batch was aborted. The aborted batch's callback
    /// receives [`protocol::UsbError::Aborted`] even when the hardware cancel
    /// fails; that failure is still returned.
    pub fn abort<E: CommandExecutor>(&self, executor: &E, endpoint: &Endpoint) -> Result<bool> {
        match endpoint.active_batch() {
            Some(batch) => self.abort_batch(executor, &batch),
            None => Ok(false),
        }
    }

    pub(crate) fn abort_batch<E: CommandExecutor>(
        &self,
        executor: &E,
        batch: &TransferBatch,
    ) -> Result<bool> {
        if batch.is_finished() {
            return Ok(false);
        }

        let cancelled = executor
            .schedule_hook()
            .map_or(Ok(()), |hook| hook.cancel(batch));
        let aborted = batch.abort();
        if aborted {
            debug!("Batch {} on endpoint {} aborted", batch.id(), batch.endpoint().number());
        }

        cancelled.map_err(HostError::Command)?;
        Ok(aborted)
    }
}

impl<C: HostController> RootHub<C> {
    /// Submit a transfer to an endpoint of `device`
    pub async fn submit<F>(
        &self,
        device: &Arc<Device>,
        request: TransferRequest,
        on_complete: F,
    ) -> Result<TransferHandle>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.scheduler
            .submit(
                self.controller.as_ref(),
                &self.registry,
                device,
                request,
                Box::new(on_complete),
            )
            .await
    }

    /// Abort whatever is outstanding on `endpoint`
    pub fn abort(&self, endpoint: &Endpoint) -> Result<bool> {
        self.scheduler.abort(self.controller.as_ref(), endpoint)
    }

    /// Abort the batch behind `handle`, if it is still pending
    pub fn abort_transfer(&self, handle: &TransferHandle) -> Result<bool> {
        match handle.batch() {
            Some(batch) => self.scheduler.abort_batch(self.controller.as_ref(), &batch),
            None => Ok(false),
        }
    }
}
