//! Prelude for convenient imports.
//!
//! ```ignore
//! use tierheap::prelude::*;
//! ```

// Core types
pub use crate::types::{GroupId, PartitionId, PoolAddr, RegionIndex, WorkerId, WORD_BYTES};

// Error handling
pub use crate::error::{Result, TierError};

// Pool surface
pub use crate::config::PoolConfig;
pub use crate::pool::TierPool;
pub use crate::region::ReclaimedRange;

// Write-back
pub use crate::io::{PoolWriter, WriteBackEngine, WritePolicy};
