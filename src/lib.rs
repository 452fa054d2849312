//! tierheap: a device-backed secondary allocation tier for garbage
//! collectors.
//!
//! A collector moves long-lived objects out of DRAM into a pool that is much
//! larger than memory: one big file-backed mapping, bump-allocated in fixed
//! regions, reclaimed by mark-sweep at region granularity, and written back
//! asynchronously with write coalescing.
//!
//! # Architecture
//!
//! ```text
//! TierPool (facade, one exclusive section for allocation state)
//! ├── BackingStore         unlinked file + shared mapping, paging hints
//! ├── RegionTable          fixed regions, key→active-region index,
//! │                        dependency graph, mark-sweep
//! ├── WriteBackEngine      per-worker slot pools → I/O threads
//! ├── PoolWriter           Immediate | Sync | Async | Durable dispatch
//! └── PromotionBuffers     per-(region, worker) write coalescing
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tierheap::prelude::*;
//!
//! let pool = TierPool::create(PoolConfig::default().with_directory("/mnt/nvme"))?;
//!
//! // Allocate and write back an object.
//! let addr = pool.allocate(16, GroupId::new(3), PartitionId::new(0))?;
//! pool.write_async(WorkerId::new(0), addr, &bytes)?;
//! while !pool.all_writes_complete(None)? {}
//!
//! // Collection cycle: re-mark, then sweep dead regions.
//! pool.reset_liveness();
//! pool.mark_used(addr);
//! for range in pool.sweep() {
//!     // reset collector-side bookkeeping over `range`
//! }
//! ```
//!
//! # Concurrency
//!
//! Write-back is partitioned by worker id: each worker owns its slice of the
//! engine's request slots and its own promotion buffers. Allocation and
//! liveness state is deliberately not partitioned; [`TierPool`] serializes it
//! behind one lock. See the module docs of [`region`] and [`io`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod io;
pub mod pool;
pub mod prelude;
pub mod promo;
pub mod region;
pub mod store;
pub mod types;

// Re-export key types at crate root for convenience.
pub use config::PoolConfig;
pub use error::{Result, TierError};
pub use io::WritePolicy;
pub use pool::TierPool;
pub use region::ReclaimedRange;
pub use types::{GroupId, PartitionId, PoolAddr, WorkerId};
