//! Per-device caching allocator
//!
//! Sits in front of the raw device allocator and recycles freed blocks
//! instead of returning them to the driver:
//!
//! - Allocations are associated with a stream. Once freed, blocks can
//!   be re-allocated on the same stream, but not on any other stream.
//! - The allocator finds the smallest cached block that fits the
//!   request, splitting it when profitable. If no block fits it
//!   delegates to the driver, and on driver OOM frees cached blocks
//!   and retries.
//! - Large (>1 MiB) and small allocations live in separate pools.
//!   Small requests are packed into 2 MiB segments; requests between
//!   1 and 10 MiB split a 20 MiB segment to reduce fragmentation.
//! - Blocks at or above the configured max split size are never split;
//!   they still satisfy oversize requests within 20 MiB of their size.
//!
//! Frees of blocks that were used on extra streams (`record_stream`)
//! are deferred behind completion events and become visible to the
//! pool once `process_events` observes the events fired.
//!
//! The public methods serialise on one mutex per device; the internal
//! methods take `&mut AllocatorInner`, so re-entrant paths (releasing
//! caches from inside an allocation) are plain internal calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::allocator::block::{
    allocation_size, round_size, Block, BlockId, BlockKey, BlockPool, PoolKind, LARGE_BUFFER,
    MIN_BLOCK_SIZE, SMALL_SIZE,
};
use crate::allocator::config::AllocatorConfig;
use crate::allocator::event_pool::{EventPool, PooledEvent};
use crate::allocator::stats::{
    format_size, update_stat_array, BlockInfo, DeviceStats, SegmentInfo, StatType,
};
use crate::allocator::trigger_free_memory_callbacks;
use crate::backend::npu_backend::{DevicePtr, NpuDriver, NpuError, NpuResult, NpuStream};

pub(crate) struct DeviceCachingAllocator {
    inner: Mutex<AllocatorInner>,
}

struct AllocatorInner {
    device: usize,
    driver: Arc<dyn NpuDriver>,
    config: AllocatorConfig,
    event_pool: Arc<EventPool>,

    stats: DeviceStats,

    /// Arena of every live block, keyed by a stable id.
    blocks: HashMap<BlockId, Block>,
    next_block_id: u64,

    /// Unallocated cached blocks 1 MiB or smaller
    small_blocks: BlockPool,
    /// Unallocated cached blocks larger than 1 MiB
    large_blocks: BlockPool,
    /// Blocks currently handed out to callers
    active_blocks: HashSet<BlockId>,
    /// Freed blocks waiting on per-stream completion events (FIFO)
    npu_events: HashMap<NpuStream, VecDeque<(PooledEvent, BlockId)>>,

    /// Bytes currently reserved from the driver
    total_allocated_memory: usize,
    /// Cap derived from the configured memory fraction
    allowed_memory_maximum: usize,
    set_fraction: bool,
    /// During teardown, cross-stream frees skip event insertion
    shutdown_stats: bool,
}

impl DeviceCachingAllocator {
    pub(crate) fn new(
        device: usize,
        driver: Arc<dyn NpuDriver>,
        config: AllocatorConfig,
        event_pool: Arc<EventPool>,
    ) -> Self {
        let mut stats = DeviceStats::default();
        stats.max_split_size = config.max_split_size.min(i64::MAX as usize) as i64;
        DeviceCachingAllocator {
            inner: Mutex::new(AllocatorInner {
                device,
                driver,
                config,
                event_pool,
                stats,
                blocks: HashMap::new(),
                next_block_id: 0,
                small_blocks: BlockPool::new(PoolKind::Small),
                large_blocks: BlockPool::new(PoolKind::Large),
                active_blocks: HashSet::new(),
                npu_events: HashMap::new(),
                total_allocated_memory: 0,
                allowed_memory_maximum: 0,
                set_fraction: false,
                shutdown_stats: false,
            }),
        }
    }

    /// Allocate a block that is safe to use from `stream`.
    pub(crate) fn malloc(&self, stream: NpuStream, size: usize) -> NpuResult<(BlockId, DevicePtr)> {
        self.inner.lock()?.malloc(stream, size)
    }

    pub(crate) fn free(&self, id: BlockId) -> NpuResult<()> {
        self.inner.lock()?.free(id)
    }

    pub(crate) fn record_stream(&self, id: BlockId, stream: NpuStream) -> NpuResult<()> {
        let mut inner = self.inner.lock()?;
        inner.block_mut(id)?.stream_uses.insert(stream);
        Ok(())
    }

    pub(crate) fn erase_stream(&self, id: BlockId, stream: NpuStream) -> NpuResult<()> {
        self.inner.lock()?.erase_stream(id, stream)
    }

    pub(crate) fn get_base_allocation(&self, id: BlockId) -> NpuResult<(DevicePtr, usize)> {
        self.inner.lock()?.get_base_allocation(id)
    }

    /// Limit this device's reserved memory to `fraction` of its total.
    pub(crate) fn set_memory_fraction(&self, fraction: f64) -> NpuResult<()> {
        self.inner.lock()?.set_memory_fraction(fraction)
    }

    /// Return every cached, unsplit block to the driver.
    pub(crate) fn empty_cache(&self, check_error: bool) -> NpuResult<()> {
        self.inner.lock()?.release_cached_blocks(check_error)
    }

    pub(crate) fn set_shutdown_stats(&self) -> NpuResult<()> {
        self.inner.lock()?.shutdown_stats = true;
        Ok(())
    }

    /// Total cached bytes and largest cached block across both pools.
    pub(crate) fn cache_info(&self) -> NpuResult<(usize, usize)> {
        self.inner.lock()?.cache_info()
    }

    pub(crate) fn stats(&self) -> NpuResult<DeviceStats> {
        Ok(self.inner.lock()?.stats.clone())
    }

    pub(crate) fn reset_accumulated_stats(&self) -> NpuResult<()> {
        self.inner.lock()?.stats.reset_accumulated();
        Ok(())
    }

    pub(crate) fn reset_peak_stats(&self) -> NpuResult<()> {
        self.inner.lock()?.stats.reset_peak();
        Ok(())
    }

    /// Full dump of the memory held by the allocator. Expensive.
    pub(crate) fn snapshot(&self) -> NpuResult<Vec<SegmentInfo>> {
        self.inner.lock()?.snapshot()
    }

    pub(crate) fn block_ptr(&self, id: BlockId) -> NpuResult<DevicePtr> {
        Ok(self.inner.lock()?.block(id)?.ptr)
    }

    pub(crate) fn block_size(&self, id: BlockId) -> NpuResult<usize> {
        Ok(self.inner.lock()?.block(id)?.size)
    }
}

impl AllocatorInner {
    fn stat_types_for(kind: PoolKind) -> [StatType; 2] {
        [StatType::Aggregate, kind.stat_type()]
    }

    fn block(&self, id: BlockId) -> NpuResult<&Block> {
        self.blocks
            .get(&id)
            .ok_or_else(|| NpuError::GenericError(format!("unknown block id {:?}", id)))
    }

    fn block_mut(&mut self, id: BlockId) -> NpuResult<&mut Block> {
        self.blocks
            .get_mut(&id)
            .ok_or_else(|| NpuError::GenericError(format!("unknown block id {:?}", id)))
    }

    fn new_block_id(&mut self) -> BlockId {
        self.next_block_id += 1;
        BlockId(self.next_block_id)
    }

    fn pool(&self, kind: PoolKind) -> &BlockPool {
        match kind {
            PoolKind::Small => &self.small_blocks,
            PoolKind::Large => &self.large_blocks,
        }
    }

    fn pool_mut(&mut self, kind: PoolKind) -> &mut BlockPool {
        match kind {
            PoolKind::Small => &mut self.small_blocks,
            PoolKind::Large => &mut self.large_blocks,
        }
    }

    fn malloc(&mut self, stream: NpuStream, size: usize) -> NpuResult<(BlockId, DevicePtr)> {
        // Deferred frees whose events have fired become visible first.
        self.process_events()?;

        let size = round_size(size);
        let pool_kind = PoolKind::for_size(size);
        let alloc_size = allocation_size(size);
        let stat_types = Self::stat_types_for(pool_kind);

        let mut found = self.get_free_block(stream, size, pool_kind);
        if found.is_none() && trigger_free_memory_callbacks() {
            found = self.get_free_block(stream, size, pool_kind);
        }

        let block_id = match found {
            Some(id) => id,
            None => {
                if self.set_fraction && self.config.garbage_collection_threshold > 0.0 {
                    self.garbage_collect_cached_blocks()?;
                }
                match self.alloc_block(stream, pool_kind, alloc_size, false) {
                    Ok(id) => id,
                    Err(e) if e.is_oom() => {
                        self.retry_alloc_after_release(stream, size, pool_kind, alloc_size)?
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let (already_split, split) = {
            let block = self.block(block_id)?;
            (block.is_split(), self.should_split(block, size))
        };

        let block_id = if split {
            // The head of the block becomes the allocation; the tail
            // goes back into the pool as a new sibling.
            let remaining_id = block_id;
            let new_id = self.new_block_id();
            let (device, ptr, rem_prev) = {
                let rem = self.block(remaining_id)?;
                (rem.device, rem.ptr, rem.prev)
            };

            let mut new_block = Block::new(device, stream, size, pool_kind, ptr);
            new_block.prev = rem_prev;
            new_block.next = Some(remaining_id);
            self.blocks.insert(new_id, new_block);
            if let Some(prev_id) = rem_prev {
                self.block_mut(prev_id)?.next = Some(new_id);
            }

            let remaining_size = {
                let rem = self.block_mut(remaining_id)?;
                rem.prev = Some(new_id);
                rem.ptr = ptr.offset(size);
                rem.size -= size;
                rem.size
            };
            let key = BlockKey::of(self.block(remaining_id)?, remaining_id);
            self.pool_mut(pool_kind).blocks.insert(key);

            if already_split {
                // An already-split inactive block is shrunk by `size`.
                update_stat_array(&mut self.stats.inactive_split_bytes, -(size as i64), &stat_types);
            } else {
                // A previously unsplit block produced a new inactive tail.
                update_stat_array(
                    &mut self.stats.inactive_split_bytes,
                    remaining_size as i64,
                    &stat_types,
                );
                update_stat_array(&mut self.stats.inactive_split, 1, &stat_types);
            }
            new_id
        } else {
            if already_split {
                // An already-split block becomes active wholesale.
                let bytes = self.block(block_id)?.size as i64;
                update_stat_array(&mut self.stats.inactive_split_bytes, -bytes, &stat_types);
                update_stat_array(&mut self.stats.inactive_split, -1, &stat_types);
            }
            block_id
        };

        let (ptr, block_size) = {
            let block = self.block_mut(block_id)?;
            block.allocated = true;
            (block.ptr, block.size)
        };
        self.active_blocks.insert(block_id);

        update_stat_array(&mut self.stats.allocation, 1, &stat_types);
        update_stat_array(&mut self.stats.allocated_bytes, block_size as i64, &stat_types);
        update_stat_array(&mut self.stats.active, 1, &stat_types);
        update_stat_array(&mut self.stats.active_bytes, block_size as i64, &stat_types);
        if block_size >= self.config.max_split_size {
            self.stats.oversize_allocations.update(1);
        }

        tracing::debug!(
            "CachingAllocator malloc: size = {}, cached = {}, allocated = {}",
            block_size,
            self.stats.reserved_bytes[StatType::Aggregate as usize].current,
            self.stats.allocated_bytes[StatType::Aggregate as usize].current,
        );

        Ok((block_id, ptr))
    }

    /// The reclaim ladder after the first driver OOM: free enough
    /// cached oversize blocks and retry, then free everything and
    /// retry once more before giving up with the full diagnostic.
    fn retry_alloc_after_release(
        &mut self,
        stream: NpuStream,
        size: usize,
        pool_kind: PoolKind,
        alloc_size: usize,
    ) -> NpuResult<BlockId> {
        if self.release_available_cached_blocks(stream, size, pool_kind)? {
            match self.alloc_block(stream, pool_kind, alloc_size, false) {
                Ok(id) => return Ok(id),
                Err(e) if e.is_oom() => {}
                Err(e) => return Err(e),
            }
        }
        self.release_cached_blocks(true)?;
        match self.alloc_block(stream, pool_kind, alloc_size, true) {
            Ok(id) => Ok(id),
            Err(e) if e.is_oom() => Err(self.build_oom_error(alloc_size)),
            Err(e) => Err(e),
        }
    }

    fn build_oom_error(&mut self, alloc_size: usize) -> NpuError {
        self.stats.num_ooms += 1;
        // Memory info is best effort here; the OOM itself is what the
        // caller needs to see.
        let (free, total) = self.driver.mem_get_info(self.device).unwrap_or((0, 0));
        let allowed_info = if self.set_fraction {
            format!("{} allowed; ", format_size(self.allowed_memory_maximum as u64))
        } else {
            String::new()
        };
        let agg = StatType::Aggregate as usize;
        NpuError::OutOfMemory(format!(
            "NPU out of memory. Tried to allocate {} (NPU {}; {} total capacity; \
             {} already allocated; {} current active; {} free; {}{} reserved in total). \
             If reserved memory is >> allocated memory try setting max_split_size_mb \
             to avoid fragmentation.",
            format_size(alloc_size as u64),
            self.device,
            format_size(total as u64),
            format_size(self.stats.allocated_bytes[agg].current.max(0) as u64),
            format_size(self.stats.active_bytes[agg].current.max(0) as u64),
            format_size(free as u64),
            allowed_info,
            format_size(self.stats.reserved_bytes[agg].current.max(0) as u64),
        ))
    }

    fn free(&mut self, id: BlockId) -> NpuResult<()> {
        // The merge logic below may rewrite ptr/size; capture the
        // caller-visible values first.
        let (pool_kind, orig_ptr, orig_size, deferred) = {
            let block = self.block_mut(id)?;
            block.allocated = false;
            (
                block.pool,
                block.ptr,
                block.size,
                !block.stream_uses.is_empty(),
            )
        };

        let stat_types = Self::stat_types_for(pool_kind);
        update_stat_array(&mut self.stats.allocation, -1, &stat_types);
        update_stat_array(&mut self.stats.allocated_bytes, -(orig_size as i64), &stat_types);
        if orig_size >= self.config.max_split_size {
            self.stats.oversize_allocations.update(-1);
        }

        if deferred && !self.shutdown_stats {
            self.insert_events(id)?;
        } else {
            self.free_block(id)?;
        }

        tracing::debug!(
            "CachingAllocator free: ptr = {}, size = {}, cached = {}, allocated = {}",
            orig_ptr,
            orig_size,
            self.stats.reserved_bytes[StatType::Aggregate as usize].current,
            self.stats.allocated_bytes[StatType::Aggregate as usize].current,
        );
        Ok(())
    }

    /// Move a block into its pool of cached free blocks, merging with
    /// free physical neighbours.
    fn free_block(&mut self, id: BlockId) -> NpuResult<()> {
        let (pool_kind, original_size, prev, next) = {
            let block = self.block(id)?;
            debug_assert!(!block.allocated && block.event_count == 0);
            (block.pool, block.size, block.prev, block.next)
        };

        let mut net_change_inactive_split_blocks: i64 = 0;
        let mut net_change_inactive_split_size: i64 = 0;
        for candidate in [prev, next] {
            if let Some(src) = candidate {
                let subsumed = self.try_merge_blocks(id, src, pool_kind)?;
                if subsumed > 0 {
                    net_change_inactive_split_blocks -= 1;
                    net_change_inactive_split_size -= subsumed as i64;
                }
            }
        }

        self.active_blocks.remove(&id);
        let key = BlockKey::of(self.block(id)?, id);
        self.pool_mut(pool_kind).blocks.insert(key);

        if self.block(id)?.is_split() {
            net_change_inactive_split_blocks += 1;
            net_change_inactive_split_size += self.block(id)?.size as i64;
        }

        let stat_types = Self::stat_types_for(pool_kind);
        update_stat_array(
            &mut self.stats.inactive_split,
            net_change_inactive_split_blocks,
            &stat_types,
        );
        update_stat_array(
            &mut self.stats.inactive_split_bytes,
            net_change_inactive_split_size,
            &stat_types,
        );
        update_stat_array(&mut self.stats.active, -1, &stat_types);
        update_stat_array(&mut self.stats.active_bytes, -(original_size as i64), &stat_types);
        Ok(())
    }

    /// Combine previously split siblings. Returns the subsumed size,
    /// or 0 when `src` cannot be merged.
    fn try_merge_blocks(&mut self, dst_id: BlockId, src_id: BlockId, pool_kind: PoolKind) -> NpuResult<usize> {
        let mergeable = match self.blocks.get(&src_id) {
            Some(src) => !src.allocated && src.event_count == 0,
            None => false,
        };
        if !mergeable {
            return Ok(0);
        }

        let (src_key, src_prev, src_next, src_ptr, src_size) = {
            let src = self.block(src_id)?;
            (BlockKey::of(src, src_id), src.prev, src.next, src.ptr, src.size)
        };

        if self.block(dst_id)?.prev == Some(src_id) {
            // src is the physical predecessor: dst absorbs it leftward
            {
                let dst = self.block_mut(dst_id)?;
                dst.ptr = src_ptr;
                dst.prev = src_prev;
                dst.size += src_size;
            }
            if let Some(p) = src_prev {
                self.block_mut(p)?.next = Some(dst_id);
            }
        } else {
            {
                let dst = self.block_mut(dst_id)?;
                dst.next = src_next;
                dst.size += src_size;
            }
            if let Some(n) = src_next {
                self.block_mut(n)?.prev = Some(dst_id);
            }
        }

        self.pool_mut(pool_kind).blocks.remove(&src_key);
        self.blocks.remove(&src_id);
        Ok(src_size)
    }

    fn should_split(&self, block: &Block, size: usize) -> bool {
        let remaining = block.size - size;
        match block.pool {
            PoolKind::Small => remaining >= MIN_BLOCK_SIZE,
            PoolKind::Large => size < self.config.max_split_size && remaining > SMALL_SIZE,
        }
    }

    /// Lower-bound pool search, filtered to the caller's stream and the
    /// oversize lending rules.
    fn get_free_block(&mut self, stream: NpuStream, size: usize, kind: PoolKind) -> Option<BlockId> {
        if self.set_fraction && self.config.garbage_collection_threshold > 0.0 {
            // Track block reuse interval only while the GC is active:
            // every search ages the blocks it skips.
            let ids: Vec<BlockId> = self.pool(kind).blocks.iter().map(|k| k.id).collect();
            for id in ids {
                if let Some(block) = self.blocks.get_mut(&id) {
                    block.gc_count += 1;
                }
            }
        }

        let key = self.pool(kind).lower_bound(stream, size)?;
        if key.stream != stream {
            return None;
        }
        let max_split = self.config.max_split_size;
        // Do not lend an oversize block to a non-oversize request
        if size < max_split && key.size >= max_split {
            return None;
        }
        // An oversize request may round up into an oversize block, but
        // only within one large-buffer of waste
        if size >= max_split && key.size >= size + LARGE_BUFFER {
            return None;
        }
        self.pool_mut(kind).blocks.remove(&key);
        if let Some(block) = self.blocks.get_mut(&key.id) {
            block.gc_count = 0;
        }
        Some(key.id)
    }

    /// Reclaim cached large-pool blocks by age until the reserved total
    /// is back under the GC threshold. Best effort and unsynchronised:
    /// only unsplit cached blocks whose events have already drained are
    /// returned, so no device synchronisation is issued.
    fn garbage_collect_cached_blocks(&mut self) -> NpuResult<()> {
        let gc_threshold = (self.config.garbage_collection_threshold
            * self.allowed_memory_maximum as f64) as usize;
        if self.total_allocated_memory <= gc_threshold {
            return Ok(());
        }
        let target_size = self.total_allocated_memory - gc_threshold;
        let mut gc_reclaimed = 0usize;

        let mut total_age = 0.0f64;
        let mut freeable_block_count = 0usize;
        for key in self.large_blocks.blocks.iter() {
            if let Some(block) = self.blocks.get(&key.id) {
                if !block.is_split() {
                    total_age += block.gc_count as f64;
                    freeable_block_count += 1;
                }
            }
        }
        if freeable_block_count == 0 {
            return Ok(());
        }

        // Repeat until the target is reached or nothing else qualifies.
        let mut block_freed = true;
        while gc_reclaimed < target_size && block_freed && freeable_block_count > 0 {
            let age_threshold = total_age / freeable_block_count as f64;
            block_freed = false;

            // Free every block older than the average this round; not
            // stopping at the target keeps the GC from retriggering on
            // the very next allocation.
            let candidates: Vec<(BlockId, usize, u64)> = self
                .large_blocks
                .blocks
                .iter()
                .filter_map(|key| {
                    self.blocks
                        .get(&key.id)
                        .filter(|b| !b.is_split() && b.gc_count as f64 >= age_threshold)
                        .map(|b| (key.id, b.size, b.gc_count))
                })
                .collect();
            for (id, size, age) in candidates {
                block_freed = true;
                gc_reclaimed += size;
                total_age -= age as f64;
                freeable_block_count -= 1;
                self.release_block(id)?;
                tracing::debug!(
                    "CachingAllocator gc: free = {}, cached = {}, allocated = {}",
                    size,
                    self.stats.reserved_bytes[StatType::Aggregate as usize].current,
                    self.stats.allocated_bytes[StatType::Aggregate as usize].current,
                );
            }
        }
        Ok(())
    }

    /// Obtain a fresh segment from the driver.
    fn alloc_block(
        &mut self,
        stream: NpuStream,
        kind: PoolKind,
        alloc_size: usize,
        is_retry: bool,
    ) -> NpuResult<BlockId> {
        if is_retry {
            self.stats.num_alloc_retries += 1;
        }

        if self.set_fraction
            && self.total_allocated_memory + alloc_size > self.allowed_memory_maximum
        {
            return Err(NpuError::OutOfMemory(format!(
                "allocation of {} bytes would exceed the allowed memory maximum of {} bytes",
                alloc_size, self.allowed_memory_maximum
            )));
        }

        let ptr = self.driver.device_alloc(self.device, alloc_size)?;
        self.total_allocated_memory += alloc_size;

        let id = self.new_block_id();
        self.blocks
            .insert(id, Block::new(self.device, stream, alloc_size, kind, ptr));

        let stat_types = Self::stat_types_for(kind);
        update_stat_array(&mut self.stats.segment, 1, &stat_types);
        update_stat_array(&mut self.stats.reserved_bytes, alloc_size as i64, &stat_types);
        if alloc_size >= self.config.max_split_size {
            self.stats.oversize_segments.update(1);
        }
        tracing::debug!("npu_memory device_alloc: size = {}", alloc_size);
        Ok(id)
    }

    /// Free one or more oversize cached blocks back to the driver, but
    /// only enough to satisfy the target size.
    fn release_available_cached_blocks(
        &mut self,
        stream: NpuStream,
        size: usize,
        kind: PoolKind,
    ) -> NpuResult<bool> {
        if self.config.max_split_size == usize::MAX {
            return Ok(false);
        }
        let target = size.max(self.config.max_split_size);

        match self.pool(kind).lower_bound(stream, target) {
            Some(key) if key.stream == stream => {
                self.release_block(key.id)?;
                Ok(true)
            }
            _ => {
                // No single block is large enough; walk down from the
                // largest cached block on this stream, freeing oversize
                // blocks until the target is covered.
                let search = BlockKey::search(stream, target);
                let max_split = self.config.max_split_size;
                let candidates: Vec<(BlockId, usize)> = self
                    .pool(kind)
                    .blocks
                    .range(..search)
                    .rev()
                    .take_while(|key| key.stream == stream && key.size >= max_split)
                    .map(|key| (key.id, key.size))
                    .collect();

                let mut released = 0usize;
                for (id, block_size) in candidates {
                    if released >= target {
                        break;
                    }
                    released += block_size;
                    self.release_block(id)?;
                }
                Ok(released >= target)
            }
        }
    }

    /// Drain all stream events, synchronise the device, and return
    /// every non-split cached block to the driver.
    fn release_cached_blocks(&mut self, check_error: bool) -> NpuResult<()> {
        // Blocks that cannot be reused because of outstanding events
        // must reach the pools before the pools are emptied.
        self.synchronize_and_free_events(check_error)?;

        if check_error {
            self.driver.device_synchronize(self.device)?;
        } else if let Err(e) = self.driver.device_synchronize(self.device) {
            tracing::warn!("ignoring device synchronize failure during cache release: {}", e);
        }

        self.release_blocks(PoolKind::Large)?;
        self.release_blocks(PoolKind::Small)?;
        Ok(())
    }

    /// Return one cached block to the driver and drop it from the arena.
    fn release_block(&mut self, id: BlockId) -> NpuResult<()> {
        let (ptr, size, kind, key) = {
            let block = self.block(id)?;
            (block.ptr, block.size, block.pool, BlockKey::of(block, id))
        };
        self.driver.device_free(ptr)?;
        self.total_allocated_memory -= size;

        let stat_types = Self::stat_types_for(kind);
        update_stat_array(&mut self.stats.segment, -1, &stat_types);
        update_stat_array(&mut self.stats.reserved_bytes, -(size as i64), &stat_types);
        if size >= self.config.max_split_size {
            self.stats.oversize_segments.update(-1);
        }
        tracing::debug!("npu_memory device_free: size = {}", size);

        self.pool_mut(kind).blocks.remove(&key);
        self.blocks.remove(&id);
        Ok(())
    }

    /// Free all non-split blocks of one pool back to the driver.
    fn release_blocks(&mut self, kind: PoolKind) -> NpuResult<()> {
        let keys: Vec<BlockKey> = self.pool(kind).blocks.iter().copied().collect();
        for key in keys {
            let unsplit = {
                let block = self.block(key.id)?;
                block.prev.is_none() && block.next.is_none()
            };
            if unsplit {
                self.release_block(key.id)?;
            }
        }
        Ok(())
    }

    /// Record a completion event on every stream the block was used on
    /// and park the block behind them.
    fn insert_events(&mut self, id: BlockId) -> NpuResult<()> {
        let streams = {
            let block = self.block_mut(id)?;
            std::mem::take(&mut block.stream_uses)
        };
        for stream in streams {
            self.driver.set_device(stream.device_index())?;
            let event = self.event_pool.get(stream.device_index(), &self.driver)?;
            event.record(stream)?;
            self.block_mut(id)?.event_count += 1;
            self.npu_events.entry(stream).or_default().push_back((event, id));
        }
        // Ownership moves from the active set to the pending deques.
        self.active_blocks.remove(&id);
        Ok(())
    }

    /// Walk each stream's pending deque front-to-back, returning blocks
    /// whose events have all fired. Stops at the first incomplete
    /// event: per-stream FIFO order makes everything behind it pending
    /// too.
    fn process_events(&mut self) -> NpuResult<()> {
        let streams: Vec<NpuStream> = self.npu_events.keys().copied().collect();
        for stream in streams {
            loop {
                let complete = {
                    let deque = match self.npu_events.get(&stream) {
                        Some(d) => d,
                        None => break,
                    };
                    match deque.front() {
                        None => break,
                        Some((event, _)) => event.query()?,
                    }
                };
                if !complete {
                    break;
                }
                let popped = self.npu_events.get_mut(&stream).and_then(|d| d.pop_front());
                let (event, id) = match popped {
                    Some(entry) => entry,
                    None => break,
                };
                drop(event); // back to the event pool
                let remaining = {
                    let block = self.block_mut(id)?;
                    block.event_count -= 1;
                    block.event_count
                };
                if remaining == 0 {
                    self.free_block(id)?;
                }
            }
            if self.npu_events.get(&stream).map_or(false, |d| d.is_empty()) {
                self.npu_events.remove(&stream);
            }
        }
        Ok(())
    }

    /// Host-wait on every outstanding event, then return the blocks.
    fn synchronize_and_free_events(&mut self, check_error: bool) -> NpuResult<()> {
        let pending = std::mem::take(&mut self.npu_events);
        for (_stream, deque) in pending {
            for (event, id) in deque {
                if check_error {
                    event.synchronize()?;
                } else if let Err(e) = event.synchronize() {
                    tracing::warn!("ignoring event synchronize failure during cache release: {}", e);
                }
                drop(event);
                let remaining = {
                    let block = self.block_mut(id)?;
                    block.event_count -= 1;
                    block.event_count
                };
                if remaining == 0 {
                    self.free_block(id)?;
                }
            }
        }
        Ok(())
    }

    fn erase_stream(&mut self, id: BlockId, stream: NpuStream) -> NpuResult<()> {
        self.block_mut(id)?.stream_uses.remove(&stream);

        // Cancel any events already recorded for this block on the
        // stream; the block may become poolable right here.
        let mut cancelled = 0usize;
        let mut deque_empty = false;
        if let Some(deque) = self.npu_events.get_mut(&stream) {
            let mut kept = VecDeque::with_capacity(deque.len());
            while let Some((event, block_id)) = deque.pop_front() {
                if block_id == id {
                    cancelled += 1;
                    drop(event);
                } else {
                    kept.push_back((event, block_id));
                }
            }
            deque_empty = kept.is_empty();
            *deque = kept;
        }
        if deque_empty {
            self.npu_events.remove(&stream);
        }

        if cancelled > 0 {
            let (remaining, allocated) = {
                let block = self.block_mut(id)?;
                block.event_count -= cancelled;
                (block.event_count, block.allocated)
            };
            if remaining == 0 && !allocated {
                self.free_block(id)?;
            }
        }
        Ok(())
    }

    fn get_base_allocation(&self, id: BlockId) -> NpuResult<(DevicePtr, usize)> {
        let mut head = id;
        while let Some(prev) = self.block(head)?.prev {
            head = prev;
        }
        let base_ptr = self.block(head)?.ptr;
        let mut total = 0usize;
        let mut cursor = Some(head);
        while let Some(cur) = cursor {
            let block = self.block(cur)?;
            total += block.size;
            cursor = block.next;
        }
        Ok((base_ptr, total))
    }

    fn set_memory_fraction(&mut self, fraction: f64) -> NpuResult<()> {
        let (_free, total) = self.driver.mem_get_info(self.device)?;
        self.allowed_memory_maximum = (fraction * total as f64) as usize;
        self.set_fraction = true;
        Ok(())
    }

    #[cfg(test)]
    fn pending_event_count(&self) -> usize {
        self.npu_events.values().map(|deque| deque.len()).sum()
    }

    fn cache_info(&self) -> NpuResult<(usize, usize)> {
        let mut total = 0usize;
        let mut largest = 0usize;
        for pool in [&self.small_blocks, &self.large_blocks] {
            for key in pool.blocks.iter() {
                total += key.size;
                largest = largest.max(key.size);
            }
        }
        Ok((total, largest))
    }

    fn snapshot(&self) -> NpuResult<Vec<SegmentInfo>> {
        let mut ids: HashSet<BlockId> = HashSet::new();
        ids.extend(self.small_blocks.blocks.iter().map(|k| k.id));
        ids.extend(self.large_blocks.blocks.iter().map(|k| k.id));
        ids.extend(self.active_blocks.iter().copied());
        for deque in self.npu_events.values() {
            ids.extend(deque.iter().map(|(_, id)| *id));
        }

        let mut result = Vec::new();
        for id in ids {
            let head = self.block(id)?;
            if head.prev.is_some() {
                continue;
            }
            let mut segment = SegmentInfo {
                device: self.device,
                address: head.ptr.0,
                is_large: matches!(head.pool, PoolKind::Large),
                ..Default::default()
            };
            let mut cursor = Some(id);
            while let Some(cur) = cursor {
                let block = self.block(cur)?;
                let active = block.allocated || block.event_count > 0;
                segment.blocks.push(BlockInfo {
                    size: block.size,
                    allocated: block.allocated,
                    active,
                });
                segment.total_size += block.size;
                if block.allocated {
                    segment.allocated_size += block.size;
                }
                if active {
                    segment.active_size += block.size;
                }
                cursor = block.next;
            }
            result.push(segment);
        }
        result.sort_by_key(|s| s.address);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::npu_backend::SimDriver;

    fn setup(total: usize) -> (Arc<SimDriver>, DeviceCachingAllocator) {
        let sim = Arc::new(SimDriver::new(1, total));
        let driver: Arc<dyn NpuDriver> = sim.clone();
        let event_pool = Arc::new(EventPool::new(1));
        let allocator =
            DeviceCachingAllocator::new(0, driver, AllocatorConfig::default(), event_pool);
        (sim, allocator)
    }

    #[test]
    fn pending_block_is_never_handed_out() {
        let (sim, allocator) = setup(64 << 20);
        let s0 = NpuStream::new(0, 1);
        let s1 = NpuStream::new(0, 2);

        let (id, ptr) = allocator.malloc(s0, 256 * 1024).unwrap();
        allocator.record_stream(id, s1).unwrap();
        sim.set_stream_busy(s1);
        allocator.free(id).unwrap();
        assert_eq!(allocator.inner.lock().unwrap().pending_event_count(), 1);

        let (_, other) = allocator.malloc(s0, 256 * 1024).unwrap();
        assert_ne!(other, ptr, "a block with outstanding events must stay parked");
    }

    #[test]
    fn erase_stream_after_free_cancels_the_pending_event() {
        let (sim, allocator) = setup(64 << 20);
        let s0 = NpuStream::new(0, 1);
        let s1 = NpuStream::new(0, 2);

        let (id, ptr) = allocator.malloc(s0, 256 * 1024).unwrap();
        allocator.record_stream(id, s1).unwrap();
        sim.set_stream_busy(s1);
        allocator.free(id).unwrap();

        // Cancelling the only recorded use returns the block to its
        // pool without waiting for s1.
        allocator.erase_stream(id, s1).unwrap();
        assert_eq!(allocator.inner.lock().unwrap().pending_event_count(), 0);
        let (_, reused) = allocator.malloc(s0, 256 * 1024).unwrap();
        assert_eq!(reused, ptr);
    }

    #[test]
    fn empty_cache_waits_on_outstanding_events() {
        let (sim, allocator) = setup(64 << 20);
        let s0 = NpuStream::new(0, 1);
        let s1 = NpuStream::new(0, 2);

        let (id, _ptr) = allocator.malloc(s0, 256 * 1024).unwrap();
        allocator.record_stream(id, s1).unwrap();
        sim.set_stream_busy(s1);
        allocator.free(id).unwrap();

        // The drain waits on the event (forcing completion) and then
        // returns the whole segment to the driver.
        allocator.empty_cache(true).unwrap();
        assert_eq!(sim.allocation_count(), 0);
        assert_eq!(allocator.inner.lock().unwrap().pending_event_count(), 0);
    }

    #[test]
    fn events_go_back_to_the_pool_after_processing() {
        let (sim, allocator) = setup(64 << 20);
        let s0 = NpuStream::new(0, 1);
        let s1 = NpuStream::new(0, 2);

        let (id, _ptr) = allocator.malloc(s0, 256 * 1024).unwrap();
        allocator.record_stream(id, s1).unwrap();
        sim.set_stream_busy(s1);
        allocator.free(id).unwrap();
        assert_eq!(sim.event_count(), 1);

        sim.complete_stream(s1);
        let _ = allocator.malloc(s0, 64 * 1024).unwrap();
        // The event still exists but is pooled for reuse, not leaked.
        assert_eq!(sim.event_count(), 1);
        assert_eq!(allocator.inner.lock().unwrap().pending_event_count(), 0);
    }
}
