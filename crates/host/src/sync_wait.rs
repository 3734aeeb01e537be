//! Blocking-style transfers
//!
//! Wraps the asynchronous submit-with-callback interface for callers that
//! want to wait for one batch. Each wait owns a one-shot channel that the
//! batch's callback fills, so exactly one waiter is released per completion.

use crate::batch::{Completion, TransferRequest};
use crate::controller::HostController;
use crate::device::Device;
use crate::error::{HostError, Result};
use crate::hub::RootHub;
use crate::scheduler::TransferHandle;
use protocol::UsbError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;

impl<C: HostController> RootHub<C> {
    /// Submit `request` and wait for its completion
    ///
    /// Returns the transferred byte count and the buffer. A transfer error is
    /// returned as [`HostError::Transfer`]; a failed submission is returned
    /// as is and nothing is waited for.
    pub async fn submit_and_wait(
        &self,
        device: &Arc<Device>,
        request: TransferRequest,
    ) -> Result<(usize, Vec<u8>)> {
        let (handle, rx) = self.submit_with_waiter(device, request).await?;
        let completion = rx.await.map_err(|_| HostError::CompletionLost(handle.id()))?;
        completion_result(completion)
    }

    /// Like [`submit_and_wait`](Self::submit_and_wait), aborting the batch if
    /// it has not completed within `timeout`
    ///
    /// A batch aborted because of the timeout reports [`HostError::TimedOut`].
    /// The batch is always finished when this returns.
    pub async fn submit_and_wait_timeout(
        &self,
        device: &Arc<Device>,
        request: TransferRequest,
        timeout: Duration,
    ) -> Result<(usize, Vec<u8>)> {
        let (handle, mut rx) = self.submit_with_waiter(device, request).await?;

        let completion = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(received) => received.map_err(|_| HostError::CompletionLost(handle.id()))?,
            Err(_) => {
                warn!("Batch {} timed out after {:?}, aborting", handle.id(), timeout);
                if let Err(e) = self.abort_transfer(&handle) {
                    warn!("Cancelling batch {} failed: {}", handle.id(), e);
                }
                let completion = rx.await.map_err(|_| HostError::CompletionLost(handle.id()))?;
                if completion.result == Err(UsbError::Aborted) {
                    return Err(HostError::TimedOut);
                }
                completion
            }
        };
        completion_result(completion)
    }

    async fn submit_with_waiter(
        &self,
        device: &Arc<Device>,
        request: TransferRequest,
    ) -> Result<(TransferHandle, oneshot::Receiver<Completion>)> {
        let (tx, rx) = oneshot::channel();
        let handle = self
            .submit(device, request, move |completion| {
                // The waiter may have given up; nothing to deliver to then.
                let _ = tx.send(completion);
            })
            .await?;
        Ok((handle, rx))
    }
}

fn completion_result(completion: Completion) -> Result<(usize, Vec<u8>)> {
    match completion.result {
        Ok(()) => Ok((completion.transferred, completion.buffer)),
        Err(e) => Err(HostError::Transfer(e)),
    }
}
