//! NPU stream handle

use std::fmt;

/// NPU stream handle.
///
/// Streams are created and owned by the surrounding framework; the
/// runtime core only needs a stable identity for them. The allocator
/// keys its free lists by stream, so the handle is `Copy + Ord + Hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NpuStream {
    device: usize,
    handle: u64,
}

impl NpuStream {
    pub fn new(device: usize, handle: u64) -> Self {
        NpuStream { device, handle }
    }

    pub fn device_index(&self) -> usize {
        self.device
    }

    /// Raw driver handle value (for FFI calls).
    pub fn handle(&self) -> u64 {
        self.handle
    }
}

impl fmt::Display for NpuStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream({}, 0x{:x})", self.device, self.handle)
    }
}
