//! NPU event wrapper for cross-stream synchronization
//!
//! Events mark a point in a stream's work; once all prior work on the
//! recording stream has completed, the event fires. The caching
//! allocator uses them to defer block reuse until every stream that
//! touched the block has passed the free point.

use std::sync::Arc;

use crate::backend::npu_backend::driver::{EventHandle, NpuDriver};
use crate::backend::npu_backend::error::NpuResult;
use crate::backend::npu_backend::stream::NpuStream;

/// Owned completion event.
///
/// The handle is created lazily through the driver and destroyed on
/// drop. `NpuEvent` does not implement `Clone`: the handle is owned,
/// and cloning would double-destroy it.
#[derive(Debug)]
pub struct NpuEvent {
    driver: Arc<dyn NpuDriver>,
    device: usize,
    handle: EventHandle,
}

impl NpuEvent {
    /// Create a new event on `device`.
    pub fn new(driver: Arc<dyn NpuDriver>, device: usize) -> NpuResult<Self> {
        let handle = driver.event_create(device)?;
        tracing::trace!("NpuEvent::new: created event {:?} on device {}", handle, device);
        Ok(NpuEvent {
            driver,
            device,
            handle,
        })
    }

    pub fn device_index(&self) -> usize {
        self.device
    }

    /// Record this event on the given stream.
    pub fn record(&self, stream: NpuStream) -> NpuResult<()> {
        self.driver.event_record(self.handle, stream)
    }

    /// Non-blocking completion check; `true` means the event has fired.
    pub fn query(&self) -> NpuResult<bool> {
        self.driver.event_query(self.handle)
    }

    /// Block the host until the event has fired.
    pub fn synchronize(&self) -> NpuResult<()> {
        self.driver.event_synchronize(self.handle)
    }
}

impl Drop for NpuEvent {
    fn drop(&mut self) {
        if let Err(e) = self.driver.event_destroy(self.handle) {
            tracing::warn!("NpuEvent::drop: failed to destroy event {:?}: {}", self.handle, e);
        }
    }
}
