//! Asynchronous kernel-submission queues
//!
//! Two bounded SPSC rings per device move work off the host thread:
//! the submission ring carries opaque kernel-launch records from the
//! host to a dedicated worker, and the release ring carries consumed
//! records' destructor work from the worker to a releaser thread.
//! Record handling is supplied once per process through
//! [`register_queue_callbacks`].

mod callbacks;
mod notify;
mod release_queue;
mod runtime_shim;
mod status;
mod task_queue;

pub use callbacks::{
    byte_buffer_callbacks, register_queue_callbacks, CopyFn, CopyReleaseParamFn, DeleteBufferFn,
    ExecuteFn, NewBufferFn, QueueCallbacks, ReleaseFn, ReleaseParamFn,
};
pub use release_queue::ReleaseQueue;
pub use status::RepoStatus;
pub use task_queue::TaskQueue;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::backend::npu_backend::NpuDriver;

#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("task queue callbacks are already registered")]
    AlreadyRegistered,
    #[error("task queue callbacks are not registered")]
    CallbacksMissing,
    #[error(
        "NPU kernel execution failed (ret = {code}). Kernel errors are reported \
         asynchronously, so this call site is not the root cause; rerun with \
         ASCEND_LAUNCH_BLOCKING=1 to surface the failing launch."
    )]
    KernelFailure { code: i32 },
    #[error("task queue internal error: {0}")]
    Internal(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

// ---------------------------------------------------------------------------
// Process-wide per-device queues
// ---------------------------------------------------------------------------

static TASK_QUEUES: OnceCell<Vec<TaskQueue>> = OnceCell::new();

/// Build one submission ring per device using the registered
/// callbacks. Called once during framework initialization, after
/// [`register_queue_callbacks`].
pub fn init_task_queues(driver: Arc<dyn NpuDriver>) -> QueueResult<()> {
    let callbacks = callbacks::registered_callbacks()
        .ok_or(QueueError::CallbacksMissing)?
        .clone();
    let device_count = driver
        .device_count()
        .map_err(|e| QueueError::Internal(e.to_string()))?;
    let mut queues = Vec::with_capacity(device_count);
    for device in 0..device_count {
        queues.push(TaskQueue::new(device, Arc::clone(&driver), callbacks.clone())?);
    }
    TASK_QUEUES
        .set(queues)
        .map_err(|_| QueueError::Internal("task queues are already initialized".to_string()))
}

/// Enqueue one record on `device`'s submission ring.
///
/// Calling before initialization is logged and ignored, never a crash.
pub fn enqueue(device: usize, record: *const u8) -> QueueResult<()> {
    match TASK_QUEUES.get().and_then(|queues| queues.get(device)) {
        Some(queue) => queue.enqueue(record),
        None => {
            tracing::error!("task queue is not initialized, ignoring enqueue for device {}", device);
            Ok(())
        }
    }
}

/// Block until `device`'s submission ring has fully drained.
pub fn make_sure_queue_empty(device: usize) -> QueueResult<()> {
    match TASK_QUEUES.get().and_then(|queues| queues.get(device)) {
        Some(queue) => queue.make_sure_queue_empty(),
        None => {
            tracing::error!(
                "task queue is not initialized, ignoring drain request for device {}",
                device
            );
            Ok(())
        }
    }
}
