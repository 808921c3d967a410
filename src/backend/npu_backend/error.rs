//! NPU driver error types

use thiserror::Error;

/// NPU driver error types
#[derive(Error, Debug, Clone)]
pub enum NpuError {
    #[error("NPU initialization failed: {0}")]
    InitializationFailed(String),
    #[error("{0}")]
    OutOfMemory(String),
    #[error("Memory allocation failed: {0}")]
    MemoryAllocationFailed(String),
    #[error("Memory query failed: {0}")]
    MemoryQueryFailed(String),
    #[error("invalid device pointer: {0}")]
    InvalidDevicePointer(String),
    #[error("Device error: {0}")]
    DeviceError(String),
    #[error("Generic error: {0}")]
    GenericError(String),
    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for NpuError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        NpuError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// NPU result type
pub type NpuResult<T> = Result<T, NpuError>;

impl NpuError {
    /// Whether the error is a driver out-of-memory condition.
    ///
    /// The caching allocator drives its reclaim ladder off this: a
    /// failed `device_alloc` is only retried after releasing cached
    /// blocks when the failure was an OOM, never for other driver
    /// errors.
    pub fn is_oom(&self) -> bool {
        matches!(self, NpuError::OutOfMemory(_))
    }

    /// Check if this error is recoverable (temporary condition)
    ///
    /// Recoverable errors may succeed on retry after freeing memory or
    /// waiting. Non-recoverable errors (initialization failures, lock
    /// poisoning, invalid pointers) should never be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NpuError::OutOfMemory(_)
                | NpuError::MemoryAllocationFailed(_)
                | NpuError::MemoryQueryFailed(_)
                | NpuError::DeviceError(_)
        )
    }
}
