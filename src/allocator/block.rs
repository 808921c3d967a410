//! Block model and free-list pools
//!
//! A `Block` is one contiguous region of device memory. Blocks split
//! from the same driver allocation form a chain through `prev`/`next`
//! (the "segment"); the chain is a navigational relation between arena
//! ids, never an ownership edge. Free blocks live in one of two pools
//! ordered by `(stream, size, ptr)` so a lower-bound search finds the
//! smallest sufficient block for a given stream.

use std::collections::{BTreeSet, HashSet};
use std::ops::Bound;

use crate::allocator::stats::StatType;
use crate::backend::npu_backend::{DevicePtr, NpuStream};

/// All sizes are rounded to at least 512 bytes
pub(crate) const MIN_BLOCK_SIZE: usize = 512;
/// Largest "small" allocation is 1 MiB
pub(crate) const SMALL_SIZE: usize = 1_048_576;
/// "Small" allocations are packed in 2 MiB segments
pub(crate) const SMALL_BUFFER: usize = 2_097_152;
/// "Large" allocations below 10 MiB are packed in 20 MiB segments
pub(crate) const LARGE_BUFFER: usize = 20_971_520;
/// Allocations between 1 and 10 MiB may use LARGE_BUFFER
pub(crate) const MIN_LARGE_ALLOC: usize = 10_485_760;
/// Round up large allocations to 2 MiB multiples
pub(crate) const ROUND_LARGE: usize = 2_097_152;
/// Per-allocation header budget added before rounding
const SIZE_HEADER: usize = 32;

/// Stable arena id of a block. Ids are never reused, so a stale id can
/// only miss, not alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolKind {
    Small,
    Large,
}

impl PoolKind {
    pub(crate) fn for_size(size: usize) -> PoolKind {
        if size <= SMALL_SIZE {
            PoolKind::Small
        } else {
            PoolKind::Large
        }
    }

    pub(crate) fn stat_type(self) -> StatType {
        match self {
            PoolKind::Small => StatType::SmallPool,
            PoolKind::Large => StatType::LargePool,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Block {
    pub device: usize,
    /// Allocation stream: freed blocks are only reused on this stream.
    pub stream: NpuStream,
    /// Extra streams the block's data was used on; while non-empty a
    /// free must be deferred behind completion events.
    pub stream_uses: HashSet<NpuStream>,
    pub size: usize,
    pub pool: PoolKind,
    pub ptr: DevicePtr,
    pub allocated: bool,
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
    /// Outstanding completion events still referencing this block.
    pub event_count: usize,
    /// Times this block was skipped during a free-list search since it
    /// was last reused; ages blocks for the fragmentation GC.
    pub gc_count: u64,
}

impl Block {
    pub(crate) fn new(
        device: usize,
        stream: NpuStream,
        size: usize,
        pool: PoolKind,
        ptr: DevicePtr,
    ) -> Self {
        Block {
            device,
            stream,
            stream_uses: HashSet::new(),
            size,
            pool,
            ptr,
            allocated: false,
            prev: None,
            next: None,
            event_count: 0,
            gc_count: 0,
        }
    }

    pub(crate) fn is_split(&self) -> bool {
        self.prev.is_some() || self.next.is_some()
    }
}

/// Ordering key of a free block: `(stream, size, ptr)` ascending. The
/// id rides along so pool hits map straight back into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct BlockKey {
    pub stream: NpuStream,
    pub size: usize,
    pub ptr: DevicePtr,
    pub id: BlockId,
}

impl BlockKey {
    pub(crate) fn of(block: &Block, id: BlockId) -> BlockKey {
        BlockKey {
            stream: block.stream,
            size: block.size,
            ptr: block.ptr,
            id,
        }
    }

    /// Synthetic lower-bound key for "at least `size` bytes on `stream`".
    pub(crate) fn search(stream: NpuStream, size: usize) -> BlockKey {
        BlockKey {
            stream,
            size,
            ptr: DevicePtr::NULL,
            id: BlockId(0),
        }
    }
}

/// One of the two free lists (small / large).
#[derive(Debug)]
pub(crate) struct BlockPool {
    pub kind: PoolKind,
    pub blocks: BTreeSet<BlockKey>,
}

impl BlockPool {
    pub(crate) fn new(kind: PoolKind) -> Self {
        BlockPool {
            kind,
            blocks: BTreeSet::new(),
        }
    }

    pub(crate) fn insert(&mut self, block: &Block, id: BlockId) {
        self.blocks.insert(BlockKey::of(block, id));
    }

    pub(crate) fn remove(&mut self, block: &Block, id: BlockId) -> bool {
        self.blocks.remove(&BlockKey::of(block, id))
    }

    /// Smallest entry at or above `(stream, size)` in pool order. The
    /// caller still has to check the candidate's stream: the first
    /// mismatch means the pool holds nothing for this stream at `size`
    /// or above.
    pub(crate) fn lower_bound(&self, stream: NpuStream, size: usize) -> Option<BlockKey> {
        self.blocks
            .range((Bound::Included(BlockKey::search(stream, size)), Bound::Unbounded))
            .next()
            .copied()
    }
}

/// Round a request up to the block-size granule, with the header budget.
pub(crate) fn round_size(size: usize) -> usize {
    let size = size + SIZE_HEADER;
    if size < MIN_BLOCK_SIZE {
        MIN_BLOCK_SIZE
    } else {
        MIN_BLOCK_SIZE * ((size + MIN_BLOCK_SIZE - 1) / MIN_BLOCK_SIZE)
    }
}

/// Segment size handed to the driver when a fresh allocation is needed.
pub(crate) fn allocation_size(size: usize) -> usize {
    if size <= SMALL_SIZE {
        SMALL_BUFFER
    } else if size < MIN_LARGE_ALLOC {
        LARGE_BUFFER
    } else {
        ROUND_LARGE * ((size + ROUND_LARGE - 1) / ROUND_LARGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_size_has_minimum_granule() {
        assert_eq!(round_size(0), MIN_BLOCK_SIZE);
        assert_eq!(round_size(1), MIN_BLOCK_SIZE);
        // 480 + 32 = 512 exactly
        assert_eq!(round_size(480), MIN_BLOCK_SIZE);
        // 481 + 32 spills into the next granule
        assert_eq!(round_size(481), 2 * MIN_BLOCK_SIZE);
    }

    #[test]
    fn round_size_is_multiple_of_granule() {
        for request in [1, 511, 512, 1000, 4096, 1_000_000] {
            assert_eq!(round_size(request) % MIN_BLOCK_SIZE, 0);
            assert!(round_size(request) >= request);
        }
    }

    #[test]
    fn allocation_size_tiers() {
        assert_eq!(allocation_size(512), SMALL_BUFFER);
        assert_eq!(allocation_size(SMALL_SIZE), SMALL_BUFFER);
        assert_eq!(allocation_size(SMALL_SIZE + 512), LARGE_BUFFER);
        assert_eq!(allocation_size(MIN_LARGE_ALLOC - 512), LARGE_BUFFER);
        // 10 MiB rounds to the next 2 MiB multiple
        assert_eq!(allocation_size(MIN_LARGE_ALLOC), MIN_LARGE_ALLOC);
        assert_eq!(allocation_size(MIN_LARGE_ALLOC + 1), MIN_LARGE_ALLOC + ROUND_LARGE);
    }

    #[test]
    fn pool_orders_by_stream_then_size_then_ptr() {
        let s0 = NpuStream::new(0, 0);
        let s1 = NpuStream::new(0, 1);
        let mut pool = BlockPool::new(PoolKind::Small);

        let mk = |stream, size, ptr, id| {
            let block = Block::new(0, stream, size, PoolKind::Small, DevicePtr(ptr));
            (block, BlockId(id))
        };
        for (block, id) in [
            mk(s0, 1024, 0x1000, 1),
            mk(s0, 2048, 0x2000, 2),
            mk(s1, 512, 0x3000, 3),
        ] {
            pool.insert(&block, id);
        }

        // Smallest sufficient block on s0
        let hit = pool.lower_bound(s0, 600).unwrap();
        assert_eq!(hit.id, BlockId(1));

        // Nothing big enough on s0: lower bound falls onto s1's entry
        let miss = pool.lower_bound(s0, 4096).unwrap();
        assert_ne!(miss.stream, s0);

        // s1 finds its own block
        let hit = pool.lower_bound(s1, 512).unwrap();
        assert_eq!(hit.id, BlockId(3));
    }

    #[test]
    fn equal_sizes_order_by_address() {
        let s0 = NpuStream::new(0, 0);
        let mut pool = BlockPool::new(PoolKind::Small);
        let far = Block::new(0, s0, 1024, PoolKind::Small, DevicePtr(0x9000));
        let near = Block::new(0, s0, 1024, PoolKind::Small, DevicePtr(0x1000));
        pool.insert(&far, BlockId(1));
        pool.insert(&near, BlockId(2));
        assert_eq!(pool.lower_bound(s0, 1024).unwrap().id, BlockId(2));
    }
}
