//! Allocator statistics and snapshot types
//!
//! Every state change that affects memory use updates both the
//! aggregate counters and the per-pool (small/large) counters; the
//! snapshot types are the read-only diagnostics dump.

use serde::Serialize;

/// One counter/gauge pair: running value, high-water mark, and the
/// monotone totals it accumulated in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub current: i64,
    pub peak: i64,
    pub allocated: i64,
    pub freed: i64,
}

impl Stat {
    pub(crate) fn update(&mut self, amount: i64) {
        self.current += amount;
        self.peak = self.peak.max(self.current);
        if amount > 0 {
            self.allocated += amount;
        }
        if amount < 0 {
            self.freed += -amount;
        }
    }

    pub(crate) fn reset_accumulated(&mut self) {
        self.allocated = 0;
        self.freed = 0;
    }

    pub(crate) fn reset_peak(&mut self) {
        self.peak = self.current;
    }
}

/// Breakdown axis for every stat array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatType {
    Aggregate = 0,
    SmallPool = 1,
    LargePool = 2,
}

pub const NUM_STAT_TYPES: usize = 3;

pub type StatArray = [Stat; NUM_STAT_TYPES];

pub(crate) fn update_stat_array(array: &mut StatArray, amount: i64, types: &[StatType]) {
    for t in types {
        array[*t as usize].update(amount);
    }
}

/// Per-device allocator statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceStats {
    /// Number of allocation requests handed out
    pub allocation: StatArray,
    /// Number of segments obtained from the driver
    pub segment: StatArray,
    /// Number of active (allocated or event-pending) blocks
    pub active: StatArray,
    /// Number of inactive split blocks (cached tails of split segments)
    pub inactive_split: StatArray,
    /// Bytes handed out to callers
    pub allocated_bytes: StatArray,
    /// Bytes reserved from the driver
    pub reserved_bytes: StatArray,
    /// Bytes in active blocks
    pub active_bytes: StatArray,
    /// Bytes in inactive split blocks
    pub inactive_split_bytes: StatArray,
    /// Failed allocations that succeeded after releasing cached blocks
    pub num_alloc_retries: u64,
    /// Allocations that failed even after all reclaim strategies
    pub num_ooms: u64,
    /// Allocations at or above the configured max split size
    pub oversize_allocations: Stat,
    /// Segments at or above the configured max split size
    pub oversize_segments: Stat,
    /// The configured max split size, for diagnostics
    pub max_split_size: i64,
}

impl DeviceStats {
    pub(crate) fn reset_accumulated(&mut self) {
        for array in [
            &mut self.allocation,
            &mut self.segment,
            &mut self.active,
            &mut self.inactive_split,
            &mut self.allocated_bytes,
            &mut self.reserved_bytes,
            &mut self.active_bytes,
            &mut self.inactive_split_bytes,
        ] {
            for stat in array.iter_mut() {
                stat.reset_accumulated();
            }
        }
        self.num_alloc_retries = 0;
        self.num_ooms = 0;
        self.oversize_allocations.reset_accumulated();
        self.oversize_segments.reset_accumulated();
    }

    pub(crate) fn reset_peak(&mut self) {
        for array in [
            &mut self.allocation,
            &mut self.segment,
            &mut self.active,
            &mut self.inactive_split,
            &mut self.allocated_bytes,
            &mut self.reserved_bytes,
            &mut self.active_bytes,
            &mut self.inactive_split_bytes,
        ] {
            for stat in array.iter_mut() {
                stat.reset_peak();
            }
        }
        self.oversize_allocations.reset_peak();
        self.oversize_segments.reset_peak();
    }
}

/// One block of a snapshot segment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BlockInfo {
    pub size: usize,
    pub allocated: bool,
    /// Allocated, or freed with completion events still outstanding.
    pub active: bool,
}

/// One driver segment: the maximal chain of split siblings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SegmentInfo {
    pub device: usize,
    pub address: u64,
    pub total_size: usize,
    pub allocated_size: usize,
    pub active_size: usize,
    pub is_large: bool,
    pub blocks: Vec<BlockInfo>,
}

/// Render a byte count the way the OOM diagnostic expects it.
pub(crate) fn format_size(size: u64) -> String {
    if size <= 1024 {
        format!("{} bytes", size)
    } else if size <= 1048576 {
        format!("{:.2} KiB", size as f64 / 1024.0)
    } else if size <= 1073741824 {
        format!("{:.2} MiB", size as f64 / 1048576.0)
    } else {
        format!("{:.2} GiB", size as f64 / 1073741824.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_update_tracks_peak_and_totals() {
        let mut stat = Stat::default();
        stat.update(100);
        stat.update(50);
        stat.update(-30);
        assert_eq!(stat.current, 120);
        assert_eq!(stat.peak, 150);
        assert_eq!(stat.allocated, 150);
        assert_eq!(stat.freed, 30);
    }

    #[test]
    fn reset_accumulated_keeps_current_and_peak() {
        let mut stat = Stat::default();
        stat.update(100);
        stat.update(-40);
        stat.reset_accumulated();
        assert_eq!(stat.current, 60);
        assert_eq!(stat.peak, 100);
        assert_eq!(stat.allocated, 0);
        assert_eq!(stat.freed, 0);
    }

    #[test]
    fn reset_peak_clamps_to_current() {
        let mut stat = Stat::default();
        stat.update(100);
        stat.update(-70);
        stat.reset_peak();
        assert_eq!(stat.peak, 30);
    }

    #[test]
    fn update_stat_array_touches_selected_types_only() {
        let mut array = StatArray::default();
        update_stat_array(&mut array, 10, &[StatType::Aggregate, StatType::SmallPool]);
        assert_eq!(array[StatType::Aggregate as usize].current, 10);
        assert_eq!(array[StatType::SmallPool as usize].current, 10);
        assert_eq!(array[StatType::LargePool as usize].current, 0);
    }

    #[test]
    fn format_size_picks_unit() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.00 KiB");
        assert_eq!(format_size(20 * 1048576), "20.00 MiB");
        assert_eq!(format_size(3 * 1073741824), "3.00 GiB");
    }
}
