//! Unified error handling for npuforge
//!
//! This module provides a centralized error type that consolidates the
//! domain-specific errors of the runtime core. It implements error
//! categorization for:
//! - User errors (recoverable, actionable by users)
//! - Internal errors (bugs, system failures)
//! - Backend errors (NPU/driver failures)

use crate::allocator::ConfigError;
use crate::backend::npu_backend::NpuError;
use crate::queue::QueueError;

/// How an error should be handled at the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Actionable by the user (free tensors and retry, fix a config value)
    User,
    /// A bug or unrecoverable system failure
    Internal,
    /// The NPU driver or a kernel failed
    Backend,
}

/// Unified error type for npuforge
#[derive(Debug, thiserror::Error)]
pub enum NpuForgeError {
    /// NPU driver or allocator failure
    #[error("NPU error: {0}")]
    Npu(#[from] NpuError),

    /// Task-queue failure
    #[error("task queue error: {0}")]
    Queue(#[from] QueueError),

    /// Malformed allocator configuration
    #[error("allocator configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl NpuForgeError {
    /// Categorize the error for surface-level handling.
    pub fn category(&self) -> ErrorCategory {
        match self {
            NpuForgeError::Npu(NpuError::OutOfMemory(_)) => ErrorCategory::User,
            NpuForgeError::Npu(NpuError::InvalidDevicePointer(_)) => ErrorCategory::Internal,
            NpuForgeError::Npu(NpuError::LockPoisoned(_)) => ErrorCategory::Internal,
            NpuForgeError::Npu(_) => ErrorCategory::Backend,
            NpuForgeError::Queue(QueueError::KernelFailure { .. }) => ErrorCategory::Backend,
            NpuForgeError::Queue(_) => ErrorCategory::Internal,
            NpuForgeError::Config(_) => ErrorCategory::User,
        }
    }
}

/// Crate-level result type
pub type ForgeResult<T> = Result<T, NpuForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_is_a_user_error() {
        let err = NpuForgeError::from(NpuError::OutOfMemory("NPU out of memory".to_string()));
        assert_eq!(err.category(), ErrorCategory::User);
    }

    #[test]
    fn kernel_failure_is_a_backend_error() {
        let err = NpuForgeError::from(QueueError::KernelFailure { code: 507011 });
        assert_eq!(err.category(), ErrorCategory::Backend);
    }

    #[test]
    fn invalid_pointer_is_internal() {
        let err = NpuForgeError::from(NpuError::InvalidDevicePointer("0xdead".to_string()));
        assert_eq!(err.category(), ErrorCategory::Internal);
    }
}
