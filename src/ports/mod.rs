//! Port interval allocation.
//!
//! [`IntervalAllocator`] partitions a managed space `[low, high)` into a
//! free map and an allocated map. Both are keyed by range start. Free
//! entries are kept maximally coalesced, which first-fit allocation and
//! fragmentation reporting rely on.
//!
//! OS-level bookkeeping lives behind [`PortKernel`]; [`PortPool`] keeps the
//! two in step.

pub mod kernel;
pub mod pool;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use kernel::{KernelError, LocalPortKernel, PortKernel};
pub use pool::{PoolError, PortPool};

// ── Range ───────────────────────────────────────────────────────

/// Half-open port range `[lo, hi)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRange {
    /// First port in the range.
    pub lo: u32,
    /// One past the last port in the range.
    pub hi: u32,
}

impl PortRange {
    /// Build a non-empty range. Returns `None` when `lo >= hi`.
    pub fn try_new(lo: u32, hi: u32) -> Option<Self> {
        (lo < hi).then_some(Self { lo, hi })
    }

    /// Number of ports covered.
    pub fn width(&self) -> u32 {
        self.hi.saturating_sub(self.lo)
    }

    /// Whether `port` falls inside the range.
    pub fn contains(&self, port: u32) -> bool {
        self.lo <= port && port < self.hi
    }

    /// Whether the two ranges share at least one port. Abutting ranges do not.
    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.lo < other.hi && other.lo < self.hi
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.lo, self.hi)
    }
}

// ── Errors ──────────────────────────────────────────────────────

/// Allocator failures. None are retryable without releasing something first.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    /// No free interval is wide enough.
    #[error("no free interval can hold {requested} ports")]
    Exhausted {
        /// Number of ports asked for.
        requested: u32,
    },

    /// The port is not the start of an allocated range.
    #[error("port {port} is not the start of an allocated range")]
    BadPort {
        /// Offending port.
        port: u32,
    },

    /// The range leaves the managed space or overlaps an allocation.
    #[error("range {range} conflicts with the managed space or an existing allocation")]
    RangeConflict {
        /// Offending range.
        range: PortRange,
    },

    /// Internal maps disagree with each other.
    #[error("allocator consistency broken: {0}")]
    Inconsistent(String),
}

// ── Allocator ───────────────────────────────────────────────────

/// First-fit allocator over a finite port space.
///
/// Not thread-safe on its own; wrap it in a lock (see [`PortPool`]).
#[derive(Debug, Clone)]
pub struct IntervalAllocator {
    low: u32,
    high: u32,
    free: BTreeMap<u32, u32>,
    allocated: BTreeMap<u32, u32>,
}

impl IntervalAllocator {
    /// Manage `[low, high)`. An empty span yields an allocator that is
    /// always exhausted.
    pub fn new(low: u32, high: u32) -> Self {
        let mut free = BTreeMap::new();
        if low < high {
            free.insert(low, high);
        }
        Self {
            low,
            high,
            free,
            allocated: BTreeMap::new(),
        }
    }

    /// The managed space.
    pub fn bounds(&self) -> (u32, u32) {
        (self.low, self.high)
    }

    /// Take `count` ports from the high end of the first free entry wide
    /// enough to hold them.
    ///
    /// # Errors
    ///
    /// [`PortError::Exhausted`] if `count` is zero or no entry fits.
    pub fn allocate(&mut self, count: u32) -> Result<PortRange, PortError> {
        if count == 0 {
            return Err(PortError::Exhausted { requested: 0 });
        }

        let (start, end) = self
            .free
            .iter()
            .find(|(lo, hi)| hi.saturating_sub(**lo) >= count)
            .map(|(lo, hi)| (*lo, *hi))
            .ok_or(PortError::Exhausted { requested: count })?;

        let lo = end
            .checked_sub(count)
            .ok_or_else(|| PortError::Inconsistent(format!("free entry [{start}, {end}) underflows")))?;

        if lo == start {
            self.free.remove(&start);
        } else {
            self.free.insert(start, lo);
        }
        self.allocated.insert(lo, end);

        Ok(PortRange { lo, hi: end })
    }

    /// Allocate a caller-chosen range, used when restoring persisted state.
    ///
    /// # Errors
    ///
    /// [`PortError::RangeConflict`] if the range is empty, leaves
    /// `[low, high)`, or overlaps any allocation.
    pub fn allocate_exact(&mut self, range: PortRange) -> Result<(), PortError> {
        let conflict = PortError::RangeConflict { range };
        if range.lo >= range.hi || range.lo < self.low || range.hi > self.high {
            return Err(conflict);
        }

        // Free entries are coalesced, so any gap inside the request is allocated.
        let (start, end) = match self.free.range(..=range.lo).next_back() {
            Some((start, end)) if *end >= range.hi => (*start, *end),
            _ => return Err(conflict),
        };

        self.free.remove(&start);
        if start < range.lo {
            self.free.insert(start, range.lo);
        }
        if range.hi < end {
            self.free.insert(range.hi, end);
        }
        self.allocated.insert(range.lo, range.hi);
        Ok(())
    }

    /// Release the allocation starting at `port`, coalescing with neighbours.
    ///
    /// # Errors
    ///
    /// [`PortError::BadPort`] if `port` is not the start of an allocation.
    pub fn deallocate(&mut self, port: u32) -> Result<PortRange, PortError> {
        let end = self
            .allocated
            .remove(&port)
            .ok_or(PortError::BadPort { port })?;
        let released = PortRange { lo: port, hi: end };

        let mut lo = port;
        let mut hi = end;
        if let Some(right_end) = self.free.remove(&end) {
            hi = right_end;
        }
        let left = self
            .free
            .range(..port)
            .next_back()
            .map(|(start, stop)| (*start, *stop));
        if let Some((left_start, left_end)) = left {
            if left_end == port {
                self.free.remove(&left_start);
                lo = left_start;
            }
        }
        self.free.insert(lo, hi);

        Ok(released)
    }

    /// Whether `port` lies inside any allocation.
    pub fn is_allocated(&self, port: u32) -> bool {
        self.allocated
            .range(..=port)
            .next_back()
            .is_some_and(|(_, hi)| port < *hi)
    }

    /// Whether any port of `range` is allocated.
    pub fn is_range_allocated(&self, range: PortRange) -> bool {
        self.allocated
            .range(..range.hi)
            .next_back()
            .is_some_and(|(_, hi)| *hi > range.lo)
    }

    /// Number of free intervals no wider than `upto`.
    pub fn report_fragmentation(&self, upto: u32) -> usize {
        self.free
            .iter()
            .filter(|(lo, hi)| hi.saturating_sub(**lo) <= upto)
            .count()
    }

    /// Free intervals in ascending order.
    pub fn free_ranges(&self) -> impl Iterator<Item = PortRange> + '_ {
        self.free.iter().map(|(lo, hi)| PortRange { lo: *lo, hi: *hi })
    }

    /// Allocated intervals in ascending order.
    pub fn allocated_ranges(&self) -> impl Iterator<Item = PortRange> + '_ {
        self.allocated
            .iter()
            .map(|(lo, hi)| PortRange { lo: *lo, hi: *hi })
    }

    /// Verify that free and allocated entries tile `[low, high)` exactly,
    /// with no empty entries and no two adjacent free entries.
    ///
    /// # Errors
    ///
    /// [`PortError::Inconsistent`] describing the first violation found.
    pub fn check_invariants(&self) -> Result<(), PortError> {
        let mut entries: Vec<(PortRange, bool)> = self
            .free_ranges()
            .map(|r| (r, true))
            .chain(self.allocated_ranges().map(|r| (r, false)))
            .collect();
        entries.sort_by_key(|(r, _)| r.lo);

        let mut cursor = self.low;
        let mut previous_free = false;
        for (range, is_free) in entries {
            if range.lo >= range.hi {
                return Err(PortError::Inconsistent(format!("empty entry {range}")));
            }
            if range.lo != cursor {
                return Err(PortError::Inconsistent(format!(
                    "expected an entry at {cursor}, found {range}"
                )));
            }
            if is_free && previous_free {
                return Err(PortError::Inconsistent(format!(
                    "free entry {range} is not coalesced with its neighbour"
                )));
            }
            cursor = range.hi;
            previous_free = is_free;
        }

        if self.low < self.high && cursor != self.high {
            return Err(PortError::Inconsistent(format!(
                "coverage stops at {cursor}, expected {}",
                self.high
            )));
        }
        Ok(())
    }
}
