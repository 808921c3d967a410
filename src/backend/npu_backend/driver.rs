//! Vendor-driver seam
//!
//! The allocator and the task queue never call the driver directly;
//! they go through [`NpuDriver`]. Handles crossing this boundary are
//! plain integers so a simulated driver can mint them without touching
//! hardware.

use std::fmt;

use crate::backend::npu_backend::error::NpuResult;
use crate::backend::npu_backend::stream::NpuStream;

/// Device memory address.
///
/// `DevicePtr(0)` is the null pointer; the allocator returns it for
/// zero-byte requests and never hands it to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Offset the address by `bytes`. Used when splitting a block: the
    /// tail of a split starts `size` bytes into the parent region.
    pub fn offset(&self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Raw driver event handle, owned by [`NpuEvent`](super::NpuEvent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// The driver operations the runtime core depends on.
///
/// One implementation talks to the real ACL runtime (`acl` feature);
/// [`SimDriver`](super::SimDriver) simulates the same contract on the
/// host. `device_alloc` must report out-of-memory as
/// [`NpuError::OutOfMemory`](super::NpuError::OutOfMemory) so the
/// caching allocator can distinguish it from fatal driver errors.
pub trait NpuDriver: Send + Sync + fmt::Debug {
    fn device_count(&self) -> NpuResult<usize>;

    fn set_device(&self, device: usize) -> NpuResult<()>;

    /// The device subsequent work is issued to (last `set_device`).
    fn current_device(&self) -> NpuResult<usize>;

    /// Returns `(free, total)` bytes of device memory.
    fn mem_get_info(&self, device: usize) -> NpuResult<(usize, usize)>;

    fn device_alloc(&self, device: usize, size: usize) -> NpuResult<DevicePtr>;

    fn device_free(&self, ptr: DevicePtr) -> NpuResult<()>;

    /// Blocks until all work queued on `stream` has completed.
    fn stream_synchronize(&self, stream: NpuStream) -> NpuResult<()>;

    /// Blocks until all work on `device` has completed.
    fn device_synchronize(&self, device: usize) -> NpuResult<()>;

    fn event_create(&self, device: usize) -> NpuResult<EventHandle>;

    fn event_destroy(&self, event: EventHandle) -> NpuResult<()>;

    /// Records `event` on `stream`; the event fires once all work
    /// queued on the stream before this call has completed.
    fn event_record(&self, event: EventHandle, stream: NpuStream) -> NpuResult<()>;

    /// Non-blocking completion check; `true` means the event has fired.
    fn event_query(&self, event: EventHandle) -> NpuResult<bool>;

    fn event_synchronize(&self, event: EventHandle) -> NpuResult<()>;
}
