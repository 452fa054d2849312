//! Region-granularity mark-sweep: the dependency/grouping graph, liveness
//! marking, and the sweep that reclaims dead regions.

use super::table::RegionTable;
use super::ReclaimedRange;
use crate::types::{PoolAddr, RegionIndex};

impl RegionTable {
    /// Record a deduplicated dependency edge `from -> to`, propagating the
    /// liveness mark immediately if `from` is already used.
    pub(super) fn add_dependency(&mut self, from: RegionIndex, to: RegionIndex) {
        debug_assert_ne!(from, to, "self-dependency");
        let region = &mut self.regions[from.as_usize()];
        if region.deps.contains(&to) {
            return;
        }
        region.deps.push(to);
        if region.used {
            self.mark_used_index(to);
        }
    }

    /// Declare that the object at `a` keeps the object at `b` alive.
    ///
    /// Resolves both addresses to regions and records an edge
    /// `region(a) -> region(b)`. A no-op when either address is outside the
    /// region space or both fall into the same region.
    pub fn link(&mut self, a: PoolAddr, b: PoolAddr) {
        let (Some(ra), Some(rb)) = (self.layout().region_of(a), self.layout().region_of(b)) else {
            return;
        };
        if ra == rb {
            return;
        }
        self.add_dependency(ra, rb);
    }

    /// Enable the grouping context on the region containing `addr`.
    ///
    /// While enabled, [`check_grouping`](Self::check_grouping) links the
    /// enabled region to every region it is asked about, letting a traversal
    /// discover cross-region references without threading region identities
    /// through its own logic.
    pub fn enable_grouping(&mut self, addr: PoolAddr) {
        self.grouping = self.layout().region_of(addr);
    }

    /// Link the enabled region to the region containing `addr`, if both
    /// resolve and differ. A no-op when no context is enabled.
    pub fn check_grouping(&mut self, addr: PoolAddr) {
        let Some(enabled) = self.grouping else {
            return;
        };
        let Some(target) = self.layout().region_of(addr) else {
            return;
        };
        if enabled == target {
            return;
        }
        self.add_dependency(enabled, target);
    }

    /// Disable the grouping context.
    pub fn disable_grouping(&mut self) {
        self.grouping = None;
    }

    /// Clear every region's liveness mark. Called once per collection cycle
    /// before the collector re-marks.
    pub fn reset_liveness(&mut self) {
        for region in &mut self.regions {
            region.used = false;
        }
    }

    /// Mark the region containing `addr` used, propagating through its
    /// dependency edges.
    pub fn mark_used(&mut self, addr: PoolAddr) {
        let Some(index) = self.layout().region_of(addr) else {
            debug_assert!(false, "mark_used of address outside the region space");
            return;
        };
        self.mark_used_index(index);
    }

    /// Worklist traversal of the dependency graph from `index`.
    ///
    /// The `used` flag doubles as the visited set, which both bounds the work
    /// on cyclic graphs and keeps the traversal off the native call stack.
    pub(super) fn mark_used_index(&mut self, index: RegionIndex) {
        if self.regions[index.as_usize()].used {
            return;
        }
        let mut stack = vec![index];
        while let Some(next) = stack.pop() {
            let region = &mut self.regions[next.as_usize()];
            if region.used {
                continue;
            }
            region.used = true;
            stack.extend(region.deps.iter().copied());
        }
    }

    /// Reclaim every region that is non-empty and unmarked.
    ///
    /// For each reclaimed region: its dependency set is dropped, the range
    /// `[start, last_allocated_start)` is reported back for the collector's
    /// own bookkeeping, the key index entry is cleared if it pointed here,
    /// and the region is reset in place. Marked regions are untouched:
    /// a region survives if any object assigned to it, or transitively
    /// dependency-linked to it, is still reachable.
    pub fn sweep(&mut self) -> Vec<ReclaimedRange> {
        let mut reclaimed = Vec::new();
        for i in 0..self.regions.len() {
            let region = &mut self.regions[i];
            if region.used || region.is_empty() {
                continue;
            }

            region.deps.clear();
            if let Some(last_start) = region.last_allocated_start {
                if last_start >= region.start {
                    reclaimed.push(ReclaimedRange {
                        start: region.start,
                        end: last_start,
                    });
                }
            }

            region.last_allocated_end = region.start;
            region.last_allocated_start = None;
            region.first_allocated = None;
            let owner = region.owner.take();

            if let Some((group, partition)) = owner {
                self.clear_key_entry(group, partition, RegionIndex::new(i as u32));
            }
        }

        tracing::debug!(reclaimed = reclaimed.len(), "swept unreachable regions");
        reclaimed
    }

    /// Log every non-empty region through `tracing::debug!`.
    pub fn dump_regions(&self) {
        for (i, region) in self.regions.iter().enumerate() {
            if !region.is_empty() {
                tracing::debug!(
                    region = i,
                    start = %region.start,
                    end = %region.last_allocated_end,
                    used = region.used,
                    "allocated region"
                );
            }
        }
    }

    /// Log every used region through `tracing::debug!`.
    pub fn dump_used_regions(&self) {
        for (i, region) in self.regions.iter().enumerate() {
            if region.used {
                tracing::debug!(region = i, start = %region.start, "used region");
            }
        }
    }

    /// Log every region with a non-empty dependency list.
    pub fn dump_groups(&self) {
        for (i, region) in self.regions.iter().enumerate() {
            if !region.deps.is_empty() {
                let deps: Vec<u32> = region.deps.iter().map(RegionIndex::as_u32).collect();
                tracing::debug!(region = i, ?deps, "region dependencies");
            }
        }
    }
}
