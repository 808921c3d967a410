//! Device memory caching allocator
//!
//! The process-wide face of the per-device caching allocators: one
//! [`DeviceCachingAllocator`] per device, plus the pointer table that
//! maps every outstanding device address back to its block. The tensor
//! storage layer consumes the free functions at the bottom
//! (`raw_alloc`, `raw_delete`, `record_stream`, ...) after a single
//! `init` during framework startup.

mod block;
mod config;
mod device;
mod event_pool;
mod stats;

pub use block::BlockId;
pub use config::{AllocatorConfig, ConfigError, ALLOC_CONF_ENV};
pub use stats::{BlockInfo, DeviceStats, SegmentInfo, Stat, StatArray, StatType, NUM_STAT_TYPES};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::{Lazy, OnceCell};

use crate::allocator::device::DeviceCachingAllocator;
use crate::allocator::event_pool::EventPool;
use crate::backend::npu_backend::{DevicePtr, NpuDriver, NpuError, NpuResult, NpuStream};

/// Opaque handle to a live block, for collaborators that hold blocks
/// directly instead of raw pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    device: usize,
    id: BlockId,
}

impl BlockHandle {
    pub fn device_index(&self) -> usize {
        self.device
    }
}

/// External collaborator invoked on allocation pressure; returns true
/// when it managed to liberate memory held elsewhere.
pub type FreeMemoryCallback = Arc<dyn Fn() -> bool + Send + Sync>;

static FREE_MEMORY_CALLBACKS: Lazy<Mutex<Vec<FreeMemoryCallback>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Register a callback the allocator may invoke before touching the
/// driver, so the wider framework can release memory it holds (e.g. a
/// compiled-kernel cache).
pub fn register_free_memory_callback(callback: FreeMemoryCallback) {
    let mut callbacks = match FREE_MEMORY_CALLBACKS.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    callbacks.push(callback);
}

pub(crate) fn trigger_free_memory_callbacks() -> bool {
    let callbacks = match FREE_MEMORY_CALLBACKS.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let mut freed = false;
    for callback in callbacks.iter() {
        freed |= callback();
    }
    freed
}

/// Process-wide caching allocator over all devices.
pub struct NpuCachingAllocator {
    driver: Arc<dyn NpuDriver>,
    device_allocators: Vec<DeviceCachingAllocator>,
    /// Every outstanding pointer, mapped back to its block
    allocated_blocks: Mutex<HashMap<DevicePtr, BlockHandle>>,
}

impl NpuCachingAllocator {
    /// One allocator per device, configured from the environment.
    pub fn new(driver: Arc<dyn NpuDriver>) -> NpuResult<Self> {
        Self::with_config(driver, *AllocatorConfig::global())
    }

    /// One allocator per device with an explicit configuration.
    pub fn with_config(driver: Arc<dyn NpuDriver>, config: AllocatorConfig) -> NpuResult<Self> {
        let device_count = driver.device_count()?;
        let event_pool = Arc::new(EventPool::new(device_count));
        let device_allocators = (0..device_count)
            .map(|device| {
                DeviceCachingAllocator::new(
                    device,
                    Arc::clone(&driver),
                    config,
                    Arc::clone(&event_pool),
                )
            })
            .collect();
        tracing::debug!("caching allocator initialized for {} device(s)", device_count);
        Ok(NpuCachingAllocator {
            driver,
            device_allocators,
            allocated_blocks: Mutex::new(HashMap::new()),
        })
    }

    pub fn device_count(&self) -> usize {
        self.device_allocators.len()
    }

    fn device_allocator(&self, device: usize) -> NpuResult<&DeviceCachingAllocator> {
        self.device_allocators.get(device).ok_or_else(|| {
            NpuError::DeviceError(format!("invalid device argument: {}", device))
        })
    }

    fn lookup(&self, ptr: DevicePtr, remove: bool) -> NpuResult<BlockHandle> {
        let mut table = self.allocated_blocks.lock()?;
        let handle = if remove {
            table.remove(&ptr)
        } else {
            table.get(&ptr).copied()
        };
        handle.ok_or_else(|| NpuError::InvalidDevicePointer(format!("{}", ptr)))
    }

    /// Allocate `size` bytes safe to use from `stream`. Zero-byte
    /// requests return the null pointer without touching any pool.
    pub fn malloc(&self, device: usize, size: usize, stream: NpuStream) -> NpuResult<DevicePtr> {
        if size == 0 {
            return Ok(DevicePtr::NULL);
        }
        let (id, ptr) = self.device_allocator(device)?.malloc(stream, size)?;
        self.allocated_blocks
            .lock()?
            .insert(ptr, BlockHandle { device, id });
        Ok(ptr)
    }

    /// Free a pointer previously returned by [`malloc`](Self::malloc).
    pub fn free(&self, ptr: DevicePtr) -> NpuResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let handle = self.lookup(ptr, true)?;
        self.device_allocator(handle.device)?.free(handle.id)
    }

    /// Note that `ptr`'s data is being used on `stream`: its eventual
    /// free will wait until the stream passes this point.
    pub fn record_stream(&self, ptr: DevicePtr, stream: NpuStream) -> NpuResult<()> {
        if ptr.is_null() {
            // Empty tensors carry a null data pointer; nothing to track.
            return Ok(());
        }
        let handle = self.lookup(ptr, false)?;
        self.device_allocator(handle.device)?.record_stream(handle.id, stream)
    }

    /// Undo a previous [`record_stream`](Self::record_stream), cancelling
    /// any completion event already queued for it.
    pub fn erase_stream(&self, ptr: DevicePtr, stream: NpuStream) -> NpuResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let handle = self.lookup(ptr, false)?;
        self.device_allocator(handle.device)?.erase_stream(handle.id, stream)
    }

    /// Walk the segment chain to the original driver allocation.
    pub fn get_base_allocation(&self, ptr: DevicePtr) -> NpuResult<(DevicePtr, usize)> {
        let handle = self.lookup(ptr, false)?;
        self.device_allocator(handle.device)?.get_base_allocation(handle.id)
    }

    /// Limit `device`'s reserved memory to `fraction` of its total.
    pub fn set_memory_fraction(&self, fraction: f64, device: usize) -> NpuResult<()> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(NpuError::GenericError(format!(
                "invalid memory fraction: {}. Please set within (0, 1].",
                fraction
            )));
        }
        self.device_allocator(device)?.set_memory_fraction(fraction)
    }

    /// Return all cached, unsplit blocks on every device to the driver.
    pub fn empty_cache(&self, check_error: bool) -> NpuResult<()> {
        for allocator in &self.device_allocators {
            allocator.empty_cache(check_error)?;
        }
        Ok(())
    }

    /// Mark process teardown: cross-stream frees stop inserting events.
    pub fn set_shutdown_stats(&self) -> NpuResult<()> {
        for allocator in &self.device_allocators {
            allocator.set_shutdown_stats()?;
        }
        Ok(())
    }

    /// Total cached bytes and largest cached block on `device`.
    pub fn cache_info(&self, device: usize) -> NpuResult<(usize, usize)> {
        self.device_allocator(device)?.cache_info()
    }

    pub fn get_device_stats(&self, device: usize) -> NpuResult<DeviceStats> {
        self.device_allocator(device)?.stats()
    }

    pub fn reset_accumulated_stats(&self, device: usize) -> NpuResult<()> {
        self.device_allocator(device)?.reset_accumulated_stats()
    }

    pub fn reset_peak_stats(&self, device: usize) -> NpuResult<()> {
        self.device_allocator(device)?.reset_peak_stats()
    }

    /// Read-only dump of every segment on every device, sorted by
    /// address. Potentially very expensive.
    pub fn snapshot(&self) -> NpuResult<Vec<SegmentInfo>> {
        let mut result = Vec::new();
        for allocator in &self.device_allocators {
            result.extend(allocator.snapshot()?);
        }
        result.sort_by_key(|segment| segment.address);
        Ok(result)
    }

    /// Allocate and return an opaque block handle instead of a pointer.
    pub fn malloc_block(
        &self,
        device: usize,
        size: usize,
        stream: NpuStream,
    ) -> NpuResult<BlockHandle> {
        let (id, ptr) = self.device_allocator(device)?.malloc(stream, size)?;
        let handle = BlockHandle { device, id };
        self.allocated_blocks.lock()?.insert(ptr, handle);
        Ok(handle)
    }

    /// Free a block through its handle.
    pub fn free_block_handle(&self, handle: BlockHandle) -> NpuResult<()> {
        let ptr = self.device_allocator(handle.device)?.block_ptr(handle.id)?;
        self.allocated_blocks.lock()?.remove(&ptr);
        self.device_allocator(handle.device)?.free(handle.id)
    }

    pub fn block_ptr(&self, handle: BlockHandle) -> NpuResult<DevicePtr> {
        self.device_allocator(handle.device)?.block_ptr(handle.id)
    }

    pub fn block_size(&self, handle: BlockHandle) -> NpuResult<usize> {
        self.device_allocator(handle.device)?.block_size(handle.id)
    }
}

// ---------------------------------------------------------------------------
// Process-wide instance
// ---------------------------------------------------------------------------

static ALLOCATOR: OnceCell<NpuCachingAllocator> = OnceCell::new();

/// Install the process-wide allocator. Called once during framework
/// initialization, before any tensor storage is created.
pub fn init(driver: Arc<dyn NpuDriver>) -> NpuResult<()> {
    let allocator = NpuCachingAllocator::new(driver)?;
    ALLOCATOR.set(allocator).map_err(|_| {
        NpuError::InitializationFailed("caching allocator is already initialized".to_string())
    })
}

fn allocator() -> NpuResult<&'static NpuCachingAllocator> {
    ALLOCATOR.get().ok_or_else(|| {
        NpuError::InitializationFailed("caching allocator is not initialized".to_string())
    })
}

/// Allocate on the current device's default stream.
pub fn raw_alloc(nbytes: usize) -> NpuResult<DevicePtr> {
    if nbytes == 0 {
        return Ok(DevicePtr::NULL);
    }
    let allocator = allocator()?;
    let device = allocator.driver.current_device()?;
    // Stream handle 0 is the device's default stream.
    allocator.malloc(device, nbytes, NpuStream::new(device, 0))
}

/// Allocate on an explicit stream.
pub fn raw_alloc_with_stream(nbytes: usize, stream: NpuStream) -> NpuResult<DevicePtr> {
    if nbytes == 0 {
        return Ok(DevicePtr::NULL);
    }
    allocator()?.malloc(stream.device_index(), nbytes, stream)
}

pub fn raw_delete(ptr: DevicePtr) -> NpuResult<()> {
    allocator()?.free(ptr)
}

pub fn record_stream(ptr: DevicePtr, stream: NpuStream) -> NpuResult<()> {
    allocator()?.record_stream(ptr, stream)
}

pub fn erase_stream(ptr: DevicePtr, stream: NpuStream) -> NpuResult<()> {
    allocator()?.erase_stream(ptr, stream)
}

pub fn get_base_allocation(ptr: DevicePtr) -> NpuResult<(DevicePtr, usize)> {
    allocator()?.get_base_allocation(ptr)
}

pub fn set_memory_fraction(fraction: f64, device: usize) -> NpuResult<()> {
    allocator()?.set_memory_fraction(fraction, device)
}

pub fn empty_cache(check_error: bool) -> NpuResult<()> {
    allocator()?.empty_cache(check_error)
}

pub fn set_shutdown_stats() -> NpuResult<()> {
    allocator()?.set_shutdown_stats()
}

pub fn cache_info(device: usize) -> NpuResult<(usize, usize)> {
    allocator()?.cache_info(device)
}

pub fn get_device_stats(device: usize) -> NpuResult<DeviceStats> {
    allocator()?.get_device_stats(device)
}

pub fn reset_accumulated_stats(device: usize) -> NpuResult<()> {
    allocator()?.reset_accumulated_stats(device)
}

pub fn reset_peak_stats(device: usize) -> NpuResult<()> {
    allocator()?.reset_peak_stats(device)
}

pub fn snapshot() -> NpuResult<Vec<SegmentInfo>> {
    allocator()?.snapshot()
}
