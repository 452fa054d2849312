//! The region table: bump allocation over the fixed region array.

use smallvec::SmallVec;

use super::PoolLayout;
use crate::error::{Result, TierError};
use crate::types::{GroupId, PartitionId, PoolAddr, RegionIndex, WORD_BYTES};

/// One fixed-size slice of the pool.
///
/// Regions are never individually created or destroyed; the whole array is
/// sized once from the pool and slots are reset in place across collection
/// cycles. A region is *empty* iff its bump cursor still sits at its start.
#[derive(Debug)]
pub(super) struct Region {
    /// Start address of the region.
    pub(super) start: PoolAddr,
    /// Address of the first object ever placed in this region's span.
    pub(super) first_allocated: Option<PoolAddr>,
    /// Start of the most recent allocation.
    pub(super) last_allocated_start: Option<PoolAddr>,
    /// Bump cursor: one past the most recent allocation.
    pub(super) last_allocated_end: PoolAddr,
    /// Liveness mark, reset each collection cycle.
    pub(super) used: bool,
    /// Key whose allocations this region is receiving, if any.
    pub(super) owner: Option<(GroupId, PartitionId)>,
    /// Regions whose liveness this region implies. Deduplicated.
    pub(super) deps: SmallVec<[RegionIndex; 4]>,
}

impl Region {
    fn new(start: PoolAddr) -> Self {
        Self {
            start,
            first_allocated: None,
            last_allocated_start: None,
            last_allocated_end: start,
            used: false,
            owner: None,
            deps: SmallVec::new(),
        }
    }

    pub(super) fn is_empty(&self) -> bool {
        self.last_allocated_end == self.start
    }
}

/// The fixed partitioning of the pool into regions, the key→active-region
/// index, and the dependency graph between regions.
///
/// Shared-mutable with no internal locking; callers serialize externally.
pub struct RegionTable {
    layout: PoolLayout,
    pub(super) regions: Vec<Region>,
    /// Active region per normalized key, `None` when the key has no open
    /// region.
    pub(super) key_index: Vec<Option<RegionIndex>>,
    max_partitions: u64,
    max_groups: u64,
    /// Persistent cursor for the circular free-region scan.
    scan_cursor: usize,
    /// Region whose grouping context is currently enabled, if any.
    pub(super) grouping: Option<RegionIndex>,
}

impl RegionTable {
    /// Build the region array and key index for `layout`.
    ///
    /// The key space is `max_groups * max_partitions` entries where
    /// `max_groups = region_count / max_partitions`; a pool too small to give
    /// every partition a region is rejected.
    pub fn new(layout: PoolLayout, max_partitions: u64) -> Result<Self> {
        debug_assert!(max_partitions > 0);
        let max_groups = layout.region_count() as u64 / max_partitions;
        if max_groups == 0 {
            return Err(TierError::InvalidConfig {
                cause: format!(
                    "{} regions cannot back a key space of {} partitions",
                    layout.region_count(),
                    max_partitions
                ),
            });
        }

        let regions = (0..layout.region_count())
            .map(|i| Region::new(layout.region_start(RegionIndex::new(i as u32))))
            .collect();

        tracing::debug!(
            regions = layout.region_count(),
            max_groups,
            max_partitions,
            "initialized region table"
        );

        Ok(Self {
            layout,
            regions,
            key_index: vec![None; (max_groups * max_partitions) as usize],
            max_partitions,
            max_groups,
            scan_cursor: 0,
            grouping: None,
        })
    }

    /// The address geometry this table was built over.
    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    /// Normalize a (group, partition) pair into the bounded key space.
    ///
    /// Group ids fold modulo `max_groups` so the index has a fixed size
    /// independent of how many distinct groups the collector ever names.
    fn key(&self, group: GroupId, partition: PartitionId) -> Result<usize> {
        if partition.as_u64() >= self.max_partitions {
            return Err(TierError::PartitionOutOfRange {
                partition: partition.as_u64(),
                max_partitions: self.max_partitions,
            });
        }
        Ok(self.key_unchecked(group, partition))
    }

    fn key_unchecked(&self, group: GroupId, partition: PartitionId) -> usize {
        debug_assert!(partition.as_u64() < self.max_partitions);
        ((group.as_u64() % self.max_groups) * self.max_partitions + partition.as_u64()) as usize
    }

    pub(super) fn clear_key_entry(&mut self, group: GroupId, partition: PartitionId, region: RegionIndex) {
        let key = self.key_unchecked(group, partition);
        if self.key_index[key] == Some(region) {
            self.key_index[key] = None;
        }
    }

    /// Allocate `size_words` words for the given key and return the start
    /// address of the allocation.
    ///
    /// Bump-allocates from the key's active region when it has room;
    /// otherwise acquires a fresh contiguous span of unused regions. Fails
    /// with [`TierError::OutOfSpace`] when no such span exists; allocation
    /// never compacts, so the collector must sweep before exhausting the pool.
    pub fn allocate(
        &mut self,
        size_words: u64,
        group: GroupId,
        partition: PartitionId,
    ) -> Result<PoolAddr> {
        debug_assert!(size_words > 0, "object size must be positive");
        let bytes = size_words
            .checked_mul(WORD_BYTES)
            .ok_or(TierError::OutOfSpace {
                requested: u64::MAX,
                regions_needed: usize::MAX,
            })?;
        let key = self.key(group, partition)?;

        if let Some(index) = self.key_index[key] {
            let region = &self.regions[index.as_usize()];
            let free = region.start.as_u64() + self.layout.region_size()
                - region.last_allocated_end.as_u64();
            if bytes <= free {
                return Ok(self.bump(index, bytes));
            }
        }

        let (head, count) = self.acquire_span(bytes)?;
        let span_start = self.layout.region_start(head);

        // Objects of at least one full region never own the key's active
        // region; the next allocation for the key starts fresh.
        if bytes < self.layout.region_size() {
            let last = RegionIndex::new(head.as_u32() + count as u32 - 1);
            self.regions[last.as_usize()].owner = Some((group, partition));
            self.key_index[key] = Some(last);
        }

        Ok(span_start)
    }

    /// Bump-allocate `bytes` from a region that is known to have room.
    fn bump(&mut self, index: RegionIndex, bytes: u64) -> PoolAddr {
        self.mark_used_index(index);
        let region_size = self.layout.region_size();
        let region = &mut self.regions[index.as_usize()];
        let start = region.last_allocated_end;
        region.last_allocated_start = Some(start);
        region.last_allocated_end = start.add(bytes);
        debug_assert!(
            region.last_allocated_end.as_u64() <= region.start.as_u64() + region_size,
            "bump cursor ran past the region boundary"
        );
        start
    }

    /// Acquire a fresh span of contiguous unused regions for `bytes` and
    /// stamp every region in it. Returns the head region and span length.
    fn acquire_span(&mut self, bytes: u64) -> Result<(RegionIndex, usize)> {
        let count = bytes.div_ceil(self.layout.region_size()) as usize;
        let head = self
            .find_contiguous(count)
            .ok_or(TierError::OutOfSpace {
                requested: bytes,
                regions_needed: count,
            })?;
        let span_start = self.layout.region_start(RegionIndex::new(head as u32));

        for i in head..head + count {
            debug_assert!(!self.regions[i].used, "acquired an already-used region");
            self.mark_used_index(RegionIndex::new(i as u32));
            if i != head {
                // The span lives and dies as one unit.
                self.add_dependency(RegionIndex::new(i as u32), RegionIndex::new(head as u32));
            }
            let region = &mut self.regions[i];
            region.first_allocated = Some(span_start);
            region.last_allocated_start = Some(span_start);
            region.last_allocated_end = span_start.add(bytes);
        }

        Ok((RegionIndex::new(head as u32), count))
    }

    /// Find `needed` contiguous empty regions, scanning circularly from the
    /// persistent cursor.
    ///
    /// The cursor resumes where the previous scan left off, amortizing the
    /// scan across many allocations. A span never wraps the end of the array:
    /// index wraparound is an address discontinuity.
    fn find_contiguous(&mut self, needed: usize) -> Option<usize> {
        let count = self.regions.len();
        if needed == 0 || needed > count {
            return None;
        }

        let mut start = self.scan_cursor;
        let mut scanned = 0usize;
        while scanned < count {
            if start + needed > count {
                scanned += count - start;
                start = 0;
                continue;
            }
            match (start..start + needed).find(|&i| !self.regions[i].is_empty()) {
                None => {
                    self.scan_cursor = (start + needed) % count;
                    return Some(start);
                }
                Some(busy) => {
                    scanned += busy + 1 - start;
                    start = (busy + 1) % count;
                }
            }
        }
        None
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    /// Number of regions currently marked used.
    pub fn used_region_count(&self) -> usize {
        self.regions.iter().filter(|r| r.used).count()
    }

    /// Number of regions holding any allocation.
    pub fn allocated_region_count(&self) -> usize {
        self.regions.iter().filter(|r| !r.is_empty()).count()
    }

    /// Start address of the region currently receiving allocations for a
    /// key, if the key has an active region.
    pub fn active_region_start(
        &self,
        group: GroupId,
        partition: PartitionId,
    ) -> Result<Option<PoolAddr>> {
        let key = self.key(group, partition)?;
        Ok(self.key_index[key].map(|i| self.regions[i.as_usize()].start))
    }

    /// Group that owns the region containing `addr`, if stamped.
    pub fn group_of(&self, addr: PoolAddr) -> Option<GroupId> {
        let index = self.layout.region_of(addr)?;
        self.regions[index.as_usize()].owner.map(|(g, _)| g)
    }

    /// Partition that owns the region containing `addr`, if stamped.
    pub fn partition_of(&self, addr: PoolAddr) -> Option<PartitionId> {
        let index = self.layout.region_of(addr)?;
        self.regions[index.as_usize()].owner.map(|(_, p)| p)
    }

    /// Whether two addresses share a region or a direct dependency edge.
    pub fn same_group(&self, a: PoolAddr, b: PoolAddr) -> bool {
        let (Some(ra), Some(rb)) = (self.layout.region_of(a), self.layout.region_of(b)) else {
            return false;
        };
        ra == rb || self.regions[ra.as_usize()].deps.contains(&rb)
    }

    /// Whether `addr` is the first object of its region's span.
    pub fn is_first_object(&self, addr: PoolAddr) -> bool {
        self.layout
            .region_of(addr)
            .is_some_and(|i| self.regions[i.as_usize()].first_allocated == Some(addr))
    }

    /// First object of the region containing `addr`.
    pub fn first_object(&self, addr: PoolAddr) -> Option<PoolAddr> {
        let index = self.layout.region_of(addr)?;
        self.regions[index.as_usize()].first_allocated
    }

    /// End of the most recent allocation in the region containing `addr`.
    pub fn last_object_end(&self, addr: PoolAddr) -> Option<PoolAddr> {
        let index = self.layout.region_of(addr)?;
        Some(self.regions[index.as_usize()].last_allocated_end)
    }

    /// Whether `addr` precedes the end of its region's most recent
    /// allocation.
    pub fn is_before_last_object(&self, addr: PoolAddr) -> bool {
        self.last_object_end(addr).is_some_and(|end| addr < end)
    }

    /// How many contiguous regions the span holding `addr` covers, or zero
    /// for an empty region.
    pub fn span_regions(&self, addr: PoolAddr) -> usize {
        let Some(index) = self.layout.region_of(addr) else {
            return 0;
        };
        let region = &self.regions[index.as_usize()];
        let Some(first) = region.first_allocated else {
            return 0;
        };
        if region.is_empty() {
            return 0;
        }
        ((region.last_allocated_end - first).div_ceil(self.layout.region_size())) as usize
    }

    /// Start addresses of used regions whose first allocation sits at the
    /// region base: the heads the collector iterates when walking placed
    /// objects region by region.
    pub fn span_heads(&self) -> Vec<PoolAddr> {
        self.regions
            .iter()
            .filter(|r| r.used && r.first_allocated == Some(r.start))
            .map(|r| r.start)
            .collect()
    }
}
