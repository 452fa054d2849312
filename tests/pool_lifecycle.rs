//! End-to-end allocation and collection-cycle tests over a real pool.

use tempfile::tempdir;
use tierheap::prelude::*;

fn scratch_pool() -> (TierPool, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let pool = TierPool::create(PoolConfig::scratch(dir.path())).unwrap();
    (pool, dir)
}

/// Region size of the scratch configuration, in words.
const REGION_WORDS: u64 = 1024 * 1024 / WORD_BYTES;

#[test]
fn allocation_positions_follow_region_geometry() {
    let (pool, _dir) = scratch_pool();
    let p = PartitionId::new(0);

    // First allocation sits at the pool start.
    let obj1 = pool.allocate(1, GroupId::new(0), p).unwrap();
    assert_eq!(obj1, pool.start_addr());

    // A new group opens the next region: exactly one region of words away.
    let obj2 = pool.allocate(200, GroupId::new(1), p).unwrap();
    assert_eq!((obj2 - obj1) / WORD_BYTES, REGION_WORDS);

    // Back to the first group: contiguous bump, one word after obj1.
    let obj3 = pool.allocate(120, GroupId::new(0), p).unwrap();
    assert_eq!((obj3 - obj1) / WORD_BYTES, 1);

    // And the second group bumps right after its own last object.
    let obj4 = pool.allocate(4, GroupId::new(1), p).unwrap();
    assert_eq!((obj4 - obj2) / WORD_BYTES, 200);
}

#[test]
fn same_key_allocations_are_increasing_until_the_region_fills() {
    let (pool, _dir) = scratch_pool();
    let g = GroupId::new(2);
    let p = PartitionId::new(1);

    let chunk = REGION_WORDS / 4;
    let mut last = None;
    for i in 0..5 {
        let addr = pool.allocate(chunk, g, p).unwrap();
        assert!(addr >= pool.start_addr() && addr < pool.end_addr());
        if let Some(prev) = last {
            if i < 4 {
                // Still in the first region: strictly increasing, adjacent.
                assert_eq!(addr - prev, chunk * WORD_BYTES);
            } else {
                // Fifth chunk no longer fits: jumps to a region boundary.
                assert_eq!((addr - pool.start_addr()) % (REGION_WORDS * WORD_BYTES), 0);
                assert!(addr > prev);
            }
        }
        last = Some(addr);
    }
}

#[test]
fn dependency_edges_protect_regions_across_sweep() {
    let (pool, _dir) = scratch_pool();
    let p = PartitionId::new(0);

    let kept = pool.allocate(8, GroupId::new(0), p).unwrap();
    let protected = pool.allocate(8, GroupId::new(1), p).unwrap();
    let doomed = pool.allocate(8, GroupId::new(2), p).unwrap();

    pool.link(kept, protected);
    pool.reset_liveness();
    pool.mark_used(kept);

    let reclaimed = pool.sweep();
    assert_eq!(reclaimed.len(), 1, "only the unlinked region is reclaimed");
    assert_eq!(reclaimed[0].start, doomed);
    assert_eq!(pool.allocated_region_count(), 2);
    assert!(pool.same_group(kept, protected));
}

#[test]
fn unmarked_pool_sweeps_to_zero_regions() {
    let (pool, _dir) = scratch_pool();
    let p = PartitionId::new(0);

    for group in 0..6 {
        pool.allocate(64, GroupId::new(group), p).unwrap();
    }
    assert_eq!(pool.allocated_region_count(), 6);

    pool.reset_liveness();
    assert_eq!(pool.used_region_count(), 0);
    let reclaimed = pool.sweep();
    assert_eq!(reclaimed.len(), 6);
    assert_eq!(pool.allocated_region_count(), 0);

    for range in reclaimed {
        assert!(range.start >= pool.start_addr());
        assert!(range.end <= pool.end_addr());
        assert!(range.start <= range.end);
    }
}

#[test]
fn grouping_context_discovers_cross_region_references() {
    let (pool, _dir) = scratch_pool();
    let p = PartitionId::new(0);

    let root = pool.allocate(8, GroupId::new(0), p).unwrap();
    let child = pool.allocate(8, GroupId::new(1), p).unwrap();

    pool.enable_grouping(root);
    pool.check_grouping(child);
    pool.disable_grouping();

    pool.reset_liveness();
    pool.mark_used(root);
    pool.sweep();
    assert_eq!(
        pool.allocated_region_count(),
        2,
        "the grouped region survives with its root"
    );
}

#[test]
fn reclaimed_regions_are_reused_for_new_allocations() {
    let (pool, _dir) = scratch_pool();
    let p = PartitionId::new(0);

    let first = pool.allocate(REGION_WORDS, GroupId::new(0), p).unwrap();
    pool.allocate(8, GroupId::new(1), p).unwrap();

    pool.reset_liveness();
    pool.sweep();
    assert_eq!(pool.allocated_region_count(), 0);

    // The scan cursor continues past the reclaimed regions, wraps, and the
    // pool keeps serving allocations until it genuinely fills.
    let again = pool.allocate(REGION_WORDS, GroupId::new(2), p).unwrap();
    assert!(again >= pool.start_addr() && again < pool.end_addr());
    let _ = first;
}

#[test]
fn multi_region_objects_report_their_span() {
    let (pool, _dir) = scratch_pool();
    let p = PartitionId::new(0);

    let big = pool.allocate(3 * REGION_WORDS, GroupId::new(0), p).unwrap();
    assert_eq!(pool.span_regions(big), 3);
    assert!(pool.is_first_object(big));
    // The key has no active region afterwards: the next allocation for the
    // same key starts a fresh region instead of continuing the span.
    assert_eq!(
        pool.active_region_start(GroupId::new(0), p).unwrap(),
        None
    );
    let next = pool.allocate(1, GroupId::new(0), p).unwrap();
    assert_eq!((next - big) / WORD_BYTES, 3 * REGION_WORDS);
}

#[test]
fn owner_introspection_reflects_the_active_region() {
    let (pool, _dir) = scratch_pool();
    let g = GroupId::new(3);
    let p = PartitionId::new(2);

    let addr = pool.allocate(16, g, p).unwrap();
    assert_eq!(pool.group_of(addr), Some(g));
    assert_eq!(pool.partition_of(addr), Some(p));
    assert_eq!(pool.active_region_start(g, p).unwrap(), Some(addr));
    assert_eq!(pool.span_heads(), vec![addr]);
}

#[test]
fn partition_outside_key_space_is_rejected() {
    let (pool, _dir) = scratch_pool();
    let result = pool.allocate(1, GroupId::new(0), PartitionId::new(4));
    assert!(matches!(result, Err(TierError::PartitionOutOfRange { .. })));
}
