//! The tier pool: the single owned service object the collector talks to.
//!
//! Owns the backing store, the region table, the write-back engine, the
//! write-policy dispatch, and the promotion buffers. All region-table
//! mutation funnels through one exclusive section here; the write paths are
//! worker-partitioned and need no shared lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::error::Result;
use crate::io::{PoolWriter, WriteBackEngine};
use crate::promo::PromotionBuffers;
use crate::region::{PoolLayout, ReclaimedRange, RegionTable};
use crate::store::BackingStore;
use crate::types::{GroupId, PartitionId, PoolAddr, WorkerId};

/// A device-backed secondary allocation tier.
///
/// Constructed once and passed by reference to every caller; there are no
/// process-wide singletons. Reinitialization means dropping the pool and
/// creating a new one.
pub struct TierPool {
    config: PoolConfig,
    store: Arc<BackingStore>,
    engine: Arc<WriteBackEngine>,
    writer: Arc<PoolWriter>,
    promos: PromotionBuffers,
    /// The shared-mutable allocation and liveness state, serialized behind
    /// this single lock.
    regions: Mutex<RegionTable>,
    /// Words handed out over the pool's lifetime. Monotone: sweeps do not
    /// decrement it.
    allocated_words: AtomicU64,
}

impl TierPool {
    /// Create the pool: backing file, mapping, region table, write-back
    /// engine, and promotion buffers.
    pub fn create(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(BackingStore::create(
            config.alignment,
            config.size,
            &config.directory,
        )?);
        let layout = PoolLayout::new(store.aligned_start(), store.end(), config.region_size);
        let regions = RegionTable::new(layout, config.max_partitions)?;
        let engine = Arc::new(WriteBackEngine::new(
            store.file_handle(),
            config.workers,
            config.total_write_slots,
            config.io_threads,
        )?);
        let writer = Arc::new(PoolWriter::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            config.write_policy,
        ));
        let promos = PromotionBuffers::new(
            layout,
            Arc::clone(&writer),
            config.workers,
            config.promo_capacity,
            config.promo_threshold,
        );

        tracing::info!(
            size = config.size,
            regions = layout.region_count(),
            region_size = config.region_size,
            workers = config.workers,
            policy = ?config.write_policy,
            "tier pool ready"
        );

        Ok(Self {
            config,
            store,
            engine,
            writer,
            promos,
            regions: Mutex::new(regions),
            allocated_words: AtomicU64::new(0),
        })
    }

    /// The configuration the pool was created with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Start of the usable, aligned pool range.
    pub fn start_addr(&self) -> PoolAddr {
        self.store.aligned_start()
    }

    /// One past the last pool address.
    pub fn end_addr(&self) -> PoolAddr {
        self.store.end()
    }

    /// Total mapped pool size in bytes.
    pub fn pool_size(&self) -> u64 {
        self.store.len()
    }

    /// Whether anything has ever been allocated.
    ///
    /// The counter is monotone (reclaiming regions does not decrement it),
    /// so this reports "never used", not "currently empty".
    pub fn is_empty(&self) -> bool {
        self.allocated_words.load(Ordering::Relaxed) == 0
    }

    // ---------------------------------------------------------------------
    // Allocation and liveness
    // ---------------------------------------------------------------------

    /// Allocate `size_words` words for `(group, partition)` and return the
    /// start address.
    pub fn allocate(
        &self,
        size_words: u64,
        group: GroupId,
        partition: PartitionId,
    ) -> Result<PoolAddr> {
        let addr = self.regions.lock().allocate(size_words, group, partition)?;
        self.allocated_words.fetch_add(size_words, Ordering::Relaxed);
        debug_assert!(addr >= self.start_addr() && addr < self.end_addr());
        Ok(addr)
    }

    /// Clear every region's liveness mark for a new collection cycle.
    pub fn reset_liveness(&self) {
        self.regions.lock().reset_liveness();
    }

    /// Mark the region containing `addr` live, transitively through its
    /// dependency edges.
    pub fn mark_used(&self, addr: PoolAddr) {
        self.regions.lock().mark_used(addr);
    }

    /// Declare that the object at `a` keeps the object at `b` alive.
    pub fn link(&self, a: PoolAddr, b: PoolAddr) {
        self.regions.lock().link(a, b);
    }

    /// Enable the grouping context on `addr`'s region.
    pub fn enable_grouping(&self, addr: PoolAddr) {
        self.regions.lock().enable_grouping(addr);
    }

    /// Link the enabled region to `addr`'s region, if any context is
    /// enabled.
    pub fn check_grouping(&self, addr: PoolAddr) {
        self.regions.lock().check_grouping(addr);
    }

    /// Disable the grouping context.
    pub fn disable_grouping(&self) {
        self.regions.lock().disable_grouping();
    }

    /// Reclaim every unmarked, non-empty region.
    ///
    /// Returns the reclaimed ranges so the collector can reset its own
    /// per-object bookkeeping over them.
    pub fn sweep(&self) -> Vec<ReclaimedRange> {
        self.regions.lock().sweep()
    }

    // ---------------------------------------------------------------------
    // Write-back
    // ---------------------------------------------------------------------

    /// Commit `data` to `dest` under the configured write policy.
    pub fn write(&self, worker: WorkerId, dest: PoolAddr, data: &[u8]) -> Result<()> {
        debug_assert!(worker.as_usize() < self.config.workers);
        self.writer.write(worker, dest, data)
    }

    /// Queue an asynchronous write of `data` to `dest` regardless of the
    /// configured policy.
    pub fn write_async(&self, worker: WorkerId, dest: PoolAddr, data: &[u8]) -> Result<()> {
        debug_assert!(worker.as_usize() < self.config.workers);
        self.engine.submit(worker, dest, data)
    }

    /// Check, without blocking, whether all asynchronous writes for
    /// `worker` (or every worker) have completed.
    pub fn all_writes_complete(&self, worker: Option<WorkerId>) -> Result<bool> {
        match worker {
            Some(worker) => self.engine.poll_worker(worker),
            None => self.engine.poll_all(),
        }
    }

    /// Block until every write issued under the configured policy is
    /// durable/visible.
    pub fn write_barrier(&self, worker: Option<WorkerId>) -> Result<()> {
        self.writer.barrier(worker)
    }

    /// Flush written data out of the page cache onto the device.
    pub fn flush_to_device(&self) -> Result<()> {
        self.store.sync_to_device()
    }

    /// Stage `data` for `dest` in the promotion buffer, or write it through
    /// if it exceeds the direct-write threshold.
    pub fn promote(&self, worker: WorkerId, dest: PoolAddr, data: &[u8]) -> Result<()> {
        debug_assert!(worker.as_usize() < self.config.workers);
        self.promos.insert(worker, dest, data)
    }

    /// Flush staged promotions, for one worker or all, and release their
    /// backing memory. Must complete before a write-back phase is declared
    /// done.
    pub fn flush_promotions(&self, worker: Option<WorkerId>) -> Result<()> {
        self.promos.flush_and_release(worker)
    }

    /// Read `len` bytes back from the pool at `addr`.
    pub fn read(&self, addr: PoolAddr, len: usize) -> Result<Vec<u8>> {
        self.store.read(addr, len)
    }

    // ---------------------------------------------------------------------
    // Paging hints
    // ---------------------------------------------------------------------

    /// Advise the kernel to expect sequential access over the pool.
    pub fn advise_sequential(&self) -> Result<()> {
        self.store.advise_sequential()
    }

    /// Advise the kernel to expect random access over the pool.
    pub fn advise_random(&self) -> Result<()> {
        self.store.advise_random()
    }

    /// Serve pool page faults with huge pages.
    #[cfg(target_os = "linux")]
    pub fn advise_huge_pages(&self) -> Result<()> {
        self.store.advise_huge_pages()
    }

    /// Serve pool page faults with regular pages.
    #[cfg(target_os = "linux")]
    pub fn advise_regular_pages(&self) -> Result<()> {
        self.store.advise_regular_pages()
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    /// Number of regions currently marked used.
    pub fn used_region_count(&self) -> usize {
        self.regions.lock().used_region_count()
    }

    /// Number of regions holding any allocation.
    pub fn allocated_region_count(&self) -> usize {
        self.regions.lock().allocated_region_count()
    }

    /// Start address of the region receiving allocations for a key, if any.
    pub fn active_region_start(
        &self,
        group: GroupId,
        partition: PartitionId,
    ) -> Result<Option<PoolAddr>> {
        self.regions.lock().active_region_start(group, partition)
    }

    /// Group that owns `addr`'s region, if stamped.
    pub fn group_of(&self, addr: PoolAddr) -> Option<GroupId> {
        self.regions.lock().group_of(addr)
    }

    /// Partition that owns `addr`'s region, if stamped.
    pub fn partition_of(&self, addr: PoolAddr) -> Option<PartitionId> {
        self.regions.lock().partition_of(addr)
    }

    /// Whether two addresses share a region or a direct dependency edge.
    pub fn same_group(&self, a: PoolAddr, b: PoolAddr) -> bool {
        self.regions.lock().same_group(a, b)
    }

    /// Whether `addr` is the first object of its region's span.
    pub fn is_first_object(&self, addr: PoolAddr) -> bool {
        self.regions.lock().is_first_object(addr)
    }

    /// First object of the region containing `addr`.
    pub fn first_object(&self, addr: PoolAddr) -> Option<PoolAddr> {
        self.regions.lock().first_object(addr)
    }

    /// End of the most recent allocation in `addr`'s region.
    pub fn last_object_end(&self, addr: PoolAddr) -> Option<PoolAddr> {
        self.regions.lock().last_object_end(addr)
    }

    /// Whether `addr` precedes its region's most recent allocation end.
    pub fn is_before_last_object(&self, addr: PoolAddr) -> bool {
        self.regions.lock().is_before_last_object(addr)
    }

    /// How many contiguous regions the span holding `addr` covers.
    pub fn span_regions(&self, addr: PoolAddr) -> usize {
        self.regions.lock().span_regions(addr)
    }

    /// Start addresses of used regions whose first allocation sits at the
    /// region base.
    pub fn span_heads(&self) -> Vec<PoolAddr> {
        self.regions.lock().span_heads()
    }

    /// Log every non-empty region at debug level.
    pub fn dump_regions(&self) {
        self.regions.lock().dump_regions();
    }

    /// Log every used region at debug level.
    pub fn dump_used_regions(&self) {
        self.regions.lock().dump_used_regions();
    }

    /// Log the dependency lists of every region that has one.
    pub fn dump_groups(&self) {
        self.regions.lock().dump_groups();
    }
}

impl std::fmt::Debug for TierPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierPool")
            .field("store", &self.store)
            .field("workers", &self.engine.worker_count())
            .field("policy", &self.writer.policy())
            .finish_non_exhaustive()
    }
}
