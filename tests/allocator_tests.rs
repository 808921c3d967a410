//! Caching-allocator behaviour against the simulated driver
//!
//! Covers split/merge, cross-stream deferred frees, OOM recovery,
//! fragmentation GC, oversize handling, and the stat/snapshot
//! invariants that must hold between top-level calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use npuforge::allocator::{AllocatorConfig, DeviceStats, NpuCachingAllocator, StatType};
use npuforge::{DevicePtr, NpuDriver, NpuError, NpuStream, SimDriver};
use serial_test::serial;

const MIB: usize = 1024 * 1024;
const SMALL_BUFFER: usize = 2 * MIB;
const LARGE_BUFFER: usize = 20 * MIB;

/// A request whose rounded size packs a 12 MiB segment exactly, so the
/// resulting block is never split.
const TWELVE_MIB_FIT: usize = 12 * MIB - 544;

fn new_allocator(total: usize) -> (Arc<SimDriver>, NpuCachingAllocator) {
    new_allocator_with_config(total, AllocatorConfig::default())
}

fn new_allocator_with_config(
    total: usize,
    config: AllocatorConfig,
) -> (Arc<SimDriver>, NpuCachingAllocator) {
    let sim = Arc::new(SimDriver::new(1, total));
    let driver: Arc<dyn NpuDriver> = sim.clone();
    let allocator = NpuCachingAllocator::with_config(driver, config).expect("allocator init");
    (sim, allocator)
}

fn stream(handle: u64) -> NpuStream {
    NpuStream::new(0, handle)
}

fn assert_stats_coherent(stats: &DeviceStats) {
    let agg = StatType::Aggregate as usize;
    let small = StatType::SmallPool as usize;
    let large = StatType::LargePool as usize;
    for (name, array) in [
        ("allocation", &stats.allocation),
        ("segment", &stats.segment),
        ("active", &stats.active),
        ("inactive_split", &stats.inactive_split),
        ("allocated_bytes", &stats.allocated_bytes),
        ("reserved_bytes", &stats.reserved_bytes),
        ("active_bytes", &stats.active_bytes),
        ("inactive_split_bytes", &stats.inactive_split_bytes),
    ] {
        assert_eq!(
            array[agg].current,
            array[small].current + array[large].current,
            "{}: aggregate must equal small + large",
            name
        );
        for stat in array.iter() {
            assert!(stat.current <= stat.peak, "{}: current exceeds peak", name);
            assert_eq!(
                stat.allocated - stat.freed,
                stat.current,
                "{}: allocated - freed must equal current",
                name
            );
        }
    }
}

#[test]
fn split_and_merge_round_trip() {
    let (sim, allocator) = new_allocator(64 * MIB);
    let s0 = stream(1);

    // Two 512 KiB allocations come out of one 2 MiB small-pool segment
    // as physical neighbours.
    let p1 = allocator.malloc(0, 512 * 1024, s0).unwrap();
    let p2 = allocator.malloc(0, 512 * 1024, s0).unwrap();
    assert_eq!(sim.allocation_count(), 1, "both must come from one segment");
    let rounded = 512 * 1024 + 512; // request + header, rounded up
    assert_eq!(p2.0, p1.0 + rounded as u64, "p2 must sit right after p1");

    allocator.free(p1).unwrap();
    allocator.free(p2).unwrap();

    // The frees merge back into exactly one free 2 MiB block at the
    // segment base.
    let snapshot = allocator.snapshot().unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].address, p1.0);
    assert_eq!(snapshot[0].total_size, SMALL_BUFFER);
    assert_eq!(snapshot[0].blocks.len(), 1, "siblings must have merged");
    assert!(!snapshot[0].blocks[0].allocated);

    // The merged block is immediately reusable at the same address.
    let p3 = allocator.malloc(0, 512 * 1024, s0).unwrap();
    assert_eq!(p3, p1, "freed block must be reused on its stream");

    assert_stats_coherent(&allocator.get_device_stats(0).unwrap());
}

#[test]
fn cross_stream_free_is_deferred_until_events_fire() {
    let (sim, allocator) = new_allocator(64 * MIB);
    let s0 = stream(1);
    let s1 = stream(2);

    let p = allocator.malloc(0, 256 * 1024, s0).unwrap();
    allocator.record_stream(p, s1).unwrap();

    // s1 has not completed: the free parks the block behind an event.
    sim.set_stream_busy(s1);
    allocator.free(p).unwrap();

    // The block must not be reused while its event is outstanding.
    let q = allocator.malloc(0, 256 * 1024, s0).unwrap();
    assert_ne!(q, p, "pending block must not be handed out");

    // Once s1 completes, the next malloc sees the block again.
    sim.complete_stream(s1);
    let r = allocator.malloc(0, 256 * 1024, s0).unwrap();
    assert_eq!(r, p, "completed block must be reused");

    assert_stats_coherent(&allocator.get_device_stats(0).unwrap());
}

#[test]
fn oom_recovery_releases_cached_blocks() {
    // 30 MiB device: one cached 20 MiB segment on s0 blocks a fresh
    // 20 MiB segment for s1 until the allocator releases its cache.
    let (sim, allocator) = new_allocator(30 * MIB);
    let s0 = stream(1);
    let s1 = stream(2);

    let p = allocator.malloc(0, 4 * MIB, s0).unwrap();
    allocator.free(p).unwrap();
    assert_eq!(sim.allocation_count(), 1, "segment must stay cached");

    let q = allocator.malloc(0, 4 * MIB, s1).unwrap();
    assert!(!q.is_null());
    assert_eq!(sim.allocation_count(), 1, "old segment must have been released");

    let stats = allocator.get_device_stats(0).unwrap();
    assert_eq!(stats.num_alloc_retries, 1);
    assert_eq!(stats.num_ooms, 0);
    assert_eq!(stats.segment[StatType::Aggregate as usize].current, 1);
    assert_eq!(
        stats.reserved_bytes[StatType::Aggregate as usize].current,
        LARGE_BUFFER as i64
    );
    assert_stats_coherent(&stats);
}

#[test]
fn gc_frees_older_unsplit_blocks_first() {
    let config = AllocatorConfig {
        max_split_size: usize::MAX,
        garbage_collection_threshold: 0.5,
    };
    let (sim, allocator) = new_allocator_with_config(100 * MIB, config);
    allocator.set_memory_fraction(0.5, 0).unwrap(); // 50 MiB allowed, GC above 25 MiB
    let s0 = stream(1);
    let s1 = stream(2);
    let s2 = stream(3);

    // Two unsplit 12 MiB blocks cached on s0 (24 MiB, below the GC
    // threshold).
    let p1 = allocator.malloc(0, TWELVE_MIB_FIT, s0).unwrap();
    let p2 = allocator.malloc(0, TWELVE_MIB_FIT, s0).unwrap();
    allocator.free(p1).unwrap();
    allocator.free(p2).unwrap();

    // A miss on s1 ages the cached blocks, then reserves a third
    // segment (36 MiB total, now above the threshold).
    let q = allocator.malloc(0, TWELVE_MIB_FIT, s1).unwrap();
    allocator.free(q).unwrap();
    assert_eq!(sim.allocation_count(), 3);

    // The next miss triggers the GC: the two older blocks are above
    // the average age and go back to the driver; the younger one
    // survives.
    let r = allocator.malloc(0, TWELVE_MIB_FIT, s2).unwrap();
    assert!(!r.is_null());
    assert_eq!(sim.allocation_count(), 2, "GC must have freed the two aged segments");

    let snapshot = allocator.snapshot().unwrap();
    assert!(
        snapshot.iter().any(|segment| segment.address == q.0),
        "the younger cached block must survive the GC"
    );
    assert_stats_coherent(&allocator.get_device_stats(0).unwrap());
}

#[test]
fn zero_byte_malloc_returns_null() {
    let (sim, allocator) = new_allocator(16 * MIB);
    let ptr = allocator.malloc(0, 0, stream(1)).unwrap();
    assert!(ptr.is_null());
    assert_eq!(sim.allocation_count(), 0, "no driver call for zero bytes");

    let stats = allocator.get_device_stats(0).unwrap();
    assert_eq!(stats.allocation[StatType::Aggregate as usize].allocated, 0);

    // Freeing the null pointer is a no-op.
    allocator.free(DevicePtr::NULL).unwrap();
}

#[test]
fn one_byte_malloc_rounds_into_the_small_pool() {
    let (_sim, allocator) = new_allocator(16 * MIB);
    let ptr = allocator.malloc(0, 1, stream(1)).unwrap();
    assert!(!ptr.is_null());

    let stats = allocator.get_device_stats(0).unwrap();
    let small = StatType::SmallPool as usize;
    assert_eq!(stats.allocated_bytes[small].current, 512);
    assert_eq!(stats.reserved_bytes[small].current, SMALL_BUFFER as i64);
    assert_eq!(stats.segment[small].current, 1);
    assert_eq!(stats.segment[StatType::LargePool as usize].current, 0);
}

#[test]
fn requests_above_one_mib_use_the_large_pool() {
    let (_sim, allocator) = new_allocator(64 * MIB);
    let ptr = allocator.malloc(0, MIB + 1, stream(1)).unwrap();
    assert!(!ptr.is_null());

    let stats = allocator.get_device_stats(0).unwrap();
    let large = StatType::LargePool as usize;
    assert_eq!(stats.segment[large].current, 1);
    assert_eq!(stats.reserved_bytes[large].current, LARGE_BUFFER as i64);
    assert_eq!(stats.segment[StatType::SmallPool as usize].current, 0);
}

#[test]
fn oversize_blocks_are_reused_whole_within_the_rounding_bound() {
    let config = AllocatorConfig {
        max_split_size: 32 * MIB,
        garbage_collection_threshold: 0.0,
    };
    let (sim, allocator) = new_allocator_with_config(100 * MIB, config);
    let s0 = stream(1);

    // 33 MiB is oversize: the segment is the request rounded to 2 MiB,
    // and the block is never split.
    let p = allocator.malloc(0, 33 * MIB, s0).unwrap();
    let stats = allocator.get_device_stats(0).unwrap();
    assert_eq!(stats.oversize_allocations.current, 1);
    assert_eq!(stats.oversize_segments.current, 1);
    let snapshot = allocator.snapshot().unwrap();
    assert_eq!(snapshot[0].blocks.len(), 1, "oversize blocks are never split");

    // An equal oversize request reuses the cached block whole.
    allocator.free(p).unwrap();
    let q = allocator.malloc(0, 33 * MIB, s0).unwrap();
    assert_eq!(q, p, "cached oversize block must satisfy the request");
    assert_eq!(sim.allocation_count(), 1);

    assert_stats_coherent(&allocator.get_device_stats(0).unwrap());
}

#[test]
fn oversize_blocks_are_not_lent_to_smaller_requests() {
    let config = AllocatorConfig {
        max_split_size: 32 * MIB,
        garbage_collection_threshold: 0.0,
    };
    let (sim, allocator) = new_allocator_with_config(100 * MIB, config);
    let s0 = stream(1);

    let p = allocator.malloc(0, 33 * MIB, s0).unwrap();
    allocator.free(p).unwrap();

    // A 2 MiB request must not take the cached oversize block.
    let q = allocator.malloc(0, 2 * MIB, s0).unwrap();
    assert_ne!(q, p);
    assert_eq!(sim.allocation_count(), 2, "a fresh segment must be reserved");
}

#[test]
fn malloc_free_restores_gauges() {
    let (_sim, allocator) = new_allocator(16 * MIB);
    let before = allocator.get_device_stats(0).unwrap();

    let ptr = allocator.malloc(0, 300_000, stream(1)).unwrap();
    allocator.free(ptr).unwrap();

    let after = allocator.get_device_stats(0).unwrap();
    let agg = StatType::Aggregate as usize;
    for (name, before_array, after_array) in [
        ("allocation", &before.allocation, &after.allocation),
        ("active", &before.active, &after.active),
        ("allocated_bytes", &before.allocated_bytes, &after.allocated_bytes),
        ("active_bytes", &before.active_bytes, &after.active_bytes),
        ("inactive_split", &before.inactive_split, &after.inactive_split),
        (
            "inactive_split_bytes",
            &before.inactive_split_bytes,
            &after.inactive_split_bytes,
        ),
    ] {
        assert_eq!(
            before_array[agg].current, after_array[agg].current,
            "{} must return to its pre-call value",
            name
        );
    }
    assert!(after.allocated_bytes[agg].peak > 0, "peak must stay elevated");
    assert_stats_coherent(&after);
}

#[test]
fn empty_cache_twice_is_a_noop() {
    let (sim, allocator) = new_allocator(16 * MIB);
    let ptr = allocator.malloc(0, 300_000, stream(1)).unwrap();
    allocator.free(ptr).unwrap();

    allocator.empty_cache(true).unwrap();
    assert_eq!(sim.allocation_count(), 0);
    assert!(allocator.snapshot().unwrap().is_empty());
    let first = serde_json::to_string(&allocator.get_device_stats(0).unwrap()).unwrap();

    // Second call has nothing to do and changes nothing.
    allocator.empty_cache(true).unwrap();
    let second = serde_json::to_string(&allocator.get_device_stats(0).unwrap()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn freed_blocks_stay_stream_local() {
    let (_sim, allocator) = new_allocator(16 * MIB);
    let s0 = stream(1);
    let s1 = stream(2);

    let p = allocator.malloc(0, 256 * 1024, s0).unwrap();
    allocator.free(p).unwrap();

    // Another stream cannot see the cached block.
    let q = allocator.malloc(0, 256 * 1024, s1).unwrap();
    assert_ne!(q, p);

    // The allocation stream still can.
    let r = allocator.malloc(0, 256 * 1024, s0).unwrap();
    assert_eq!(r, p);
}

#[test]
fn erase_stream_before_free_makes_the_free_immediate() {
    let (sim, allocator) = new_allocator(16 * MIB);
    let s0 = stream(1);
    let s1 = stream(2);

    let p = allocator.malloc(0, 256 * 1024, s0).unwrap();
    allocator.record_stream(p, s1).unwrap();
    allocator.erase_stream(p, s1).unwrap();

    // With the use erased, the free needs no events even though s1
    // never completed.
    sim.set_stream_busy(s1);
    allocator.free(p).unwrap();
    let q = allocator.malloc(0, 256 * 1024, s0).unwrap();
    assert_eq!(q, p, "block must be immediately reusable");
}

#[test]
fn memory_fraction_cap_produces_a_diagnostic_oom() {
    let (_sim, allocator) = new_allocator(100 * MIB);
    allocator.set_memory_fraction(0.1, 0).unwrap(); // 10 MiB allowed

    let err = allocator.malloc(0, TWELVE_MIB_FIT, stream(1)).unwrap_err();
    match &err {
        NpuError::OutOfMemory(message) => {
            assert!(message.contains("NPU out of memory"), "message: {}", message);
            assert!(message.contains("allowed"), "cap must appear: {}", message);
        }
        other => panic!("expected OutOfMemory, got {:?}", other),
    }

    let stats = allocator.get_device_stats(0).unwrap();
    assert_eq!(stats.num_ooms, 1);
}

#[test]
fn invalid_pointers_are_rejected() {
    let (_sim, allocator) = new_allocator(16 * MIB);
    let bogus = DevicePtr(0xdead_beef);
    assert!(matches!(
        allocator.free(bogus),
        Err(NpuError::InvalidDevicePointer(_))
    ));
    assert!(matches!(
        allocator.get_base_allocation(bogus),
        Err(NpuError::InvalidDevicePointer(_))
    ));
    assert!(matches!(
        allocator.record_stream(bogus, stream(1)),
        Err(NpuError::InvalidDevicePointer(_))
    ));
}

#[test]
fn base_allocation_walks_to_the_segment_head() {
    let (_sim, allocator) = new_allocator(16 * MIB);
    let s0 = stream(1);
    let p1 = allocator.malloc(0, 512 * 1024, s0).unwrap();
    let p2 = allocator.malloc(0, 512 * 1024, s0).unwrap();

    let (base, total) = allocator.get_base_allocation(p2).unwrap();
    assert_eq!(base, p1, "base must be the segment head");
    assert_eq!(total, SMALL_BUFFER, "total must span the whole segment");
}

#[test]
fn snapshot_is_sorted_and_conserves_segment_bytes() {
    let (_sim, allocator) = new_allocator(64 * MIB);
    let s0 = stream(1);

    let mut live = Vec::new();
    for size in [100 * 1024, 700 * 1024, 3 * MIB, 256 * 1024, 5 * MIB] {
        live.push(allocator.malloc(0, size, s0).unwrap());
    }
    for ptr in [live[1], live[3]] {
        allocator.free(ptr).unwrap();
    }

    let stats = allocator.get_device_stats(0).unwrap();
    let snapshot = allocator.snapshot().unwrap();

    let mut previous = 0u64;
    let mut reserved = 0usize;
    for segment in &snapshot {
        assert!(segment.address > previous, "snapshot must be address-sorted");
        previous = segment.address;
        reserved += segment.total_size;

        let block_sum: usize = segment.blocks.iter().map(|b| b.size).sum();
        assert_eq!(block_sum, segment.total_size, "segment bytes must be conserved");

        // No two physically adjacent blocks may both be free.
        for pair in segment.blocks.windows(2) {
            assert!(
                pair[0].active || pair[1].active,
                "adjacent free siblings must have merged"
            );
        }
    }
    assert_eq!(
        reserved as i64,
        stats.reserved_bytes[StatType::Aggregate as usize].current,
        "snapshot must account for every reserved byte"
    );
    assert_stats_coherent(&stats);
}

#[test]
#[serial]
fn free_memory_callbacks_run_on_allocation_pressure() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    npuforge::allocator::register_free_memory_callback(Arc::new(|| {
        CALLS.fetch_add(1, Ordering::SeqCst);
        false
    }));

    let (_sim, allocator) = new_allocator(16 * MIB);
    let before = CALLS.load(Ordering::SeqCst);
    // A pool miss consults the callbacks before the driver.
    allocator.malloc(0, 256 * 1024, stream(1)).unwrap();
    assert!(CALLS.load(Ordering::SeqCst) > before);
}

#[test]
fn reset_stats_clears_history_but_not_gauges() {
    let (_sim, allocator) = new_allocator(16 * MIB);
    let ptr = allocator.malloc(0, 300_000, stream(1)).unwrap();

    allocator.reset_accumulated_stats(0).unwrap();
    allocator.reset_peak_stats(0).unwrap();

    let stats = allocator.get_device_stats(0).unwrap();
    let agg = StatType::Aggregate as usize;
    assert_eq!(stats.allocated_bytes[agg].freed, 0);
    assert_eq!(stats.allocated_bytes[agg].allocated, 0);
    assert!(stats.allocated_bytes[agg].current > 0, "gauge must survive the reset");
    assert_eq!(
        stats.allocated_bytes[agg].peak,
        stats.allocated_bytes[agg].current,
        "peak must be clamped to current"
    );

    allocator.free(ptr).unwrap();
    let stats = allocator.get_device_stats(0).unwrap();
    assert!(stats.allocated_bytes[agg].freed > 0);
    assert_stats_coherent(&stats);
}

#[test]
#[serial]
fn global_allocator_api_round_trip() {
    // The process-wide surface; every other test drives instances.
    let sim = Arc::new(SimDriver::new(1, 64 * MIB));
    let driver: Arc<dyn NpuDriver> = sim.clone();
    npuforge::allocator::init(driver.clone()).expect("global init");
    assert!(npuforge::allocator::init(driver).is_err(), "second init must fail");

    assert!(npuforge::allocator::raw_alloc(0).unwrap().is_null());

    let ptr = npuforge::allocator::raw_alloc(4096).unwrap();
    assert!(!ptr.is_null());

    let s1 = NpuStream::new(0, 9);
    npuforge::allocator::record_stream(ptr, s1).unwrap();
    npuforge::allocator::erase_stream(ptr, s1).unwrap();

    let (base, total) = npuforge::allocator::get_base_allocation(ptr).unwrap();
    assert_eq!(base, ptr);
    assert_eq!(total, SMALL_BUFFER);

    let ptr2 = npuforge::allocator::raw_alloc_with_stream(4096, NpuStream::new(0, 7)).unwrap();
    assert!(!ptr2.is_null());

    assert!(!npuforge::allocator::snapshot().unwrap().is_empty());
    assert!(npuforge::allocator::cache_info(0).is_ok());
    assert!(npuforge::allocator::set_memory_fraction(1.5, 0).is_err());

    npuforge::allocator::raw_delete(ptr).unwrap();
    npuforge::allocator::raw_delete(ptr2).unwrap();
    npuforge::allocator::empty_cache(true).unwrap();
    assert_eq!(sim.allocation_count(), 0);

    npuforge::allocator::reset_accumulated_stats(0).unwrap();
    npuforge::allocator::reset_peak_stats(0).unwrap();
    let stats = npuforge::allocator::get_device_stats(0).unwrap();
    assert_eq!(stats.allocated_bytes[StatType::Aggregate as usize].current, 0);

    npuforge::allocator::set_shutdown_stats().unwrap();
}
