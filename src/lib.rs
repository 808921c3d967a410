//! npuforge - NPU runtime core
//!
//! The runtime plumbing an NPU plugin for a PyTorch-like tensor
//! framework sits on:
//!
//! - a stream-aware **device memory caching allocator** that recycles
//!   freed blocks instead of calling the driver, with cross-stream
//!   safety through completion events ([`allocator`])
//! - an **asynchronous task queue** that moves kernel-launch records
//!   from the host to a dedicated submission thread, with a paired
//!   release ring that keeps destructor work off the hot path
//!   ([`queue`])
//!
//! Both talk to the vendor driver through the
//! [`NpuDriver`](backend::npu_backend::NpuDriver) seam: the `acl`
//! feature links the real CANN/ACL runtime, and
//! [`SimDriver`](backend::npu_backend::SimDriver) simulates it on the
//! host for development and tests.

pub mod allocator;
pub mod backend;
pub mod error;
pub mod logging;
pub mod options;
pub mod queue;

pub use allocator::{AllocatorConfig, DeviceStats, NpuCachingAllocator, SegmentInfo};
pub use backend::npu_backend::{DevicePtr, NpuDriver, NpuError, NpuResult, NpuStream, SimDriver};
pub use error::{ErrorCategory, ForgeResult, NpuForgeError};
pub use queue::{QueueCallbacks, QueueError, QueueResult, RepoStatus, TaskQueue};
